//! Autoscaler: periodically compares each function's healthy-instance ratio
//! against scale thresholds and provisions or retires one instance per tick.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{is_instance_available, Orchestrator};
use crate::executor::now_epoch;

const SCALE_UP_THRESHOLD: f64 = 0.8;
const SCALE_DOWN_THRESHOLD: f64 = 0.3;
const ERROR_BACKOFF_SECS: u64 = 30;

/// Runs until `shutdown` is cancelled, ticking every `tick_interval_secs`
/// (backing off to `ERROR_BACKOFF_SECS` after a failed pass).
pub async fn run_autoscaler(orchestrator: Arc<Orchestrator>, tick_interval_secs: u64, shutdown: CancellationToken) {
    info!("autoscaler started");
    loop {
        let wait = match check_and_scale(&orchestrator).await {
            Ok(()) => Duration::from_secs(tick_interval_secs),
            Err(e) => {
                error!("autoscaler pass failed: {e}");
                Duration::from_secs(ERROR_BACKOFF_SECS)
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("autoscaler stopped");
}

async fn check_and_scale(orchestrator: &Arc<Orchestrator>) -> Result<(), super::OrchestratorError> {
    for function_name in orchestrator.registry.list() {
        let Some(config) = orchestrator.registry.get(&function_name) else {
            continue;
        };
        let state = orchestrator.lb_state(&function_name);

        let now = now_epoch();
        if now - state.last_scale_event.load(Ordering::Relaxed) < orchestrator.min_scale_interval_secs {
            continue;
        }

        let ids = state.runtime_ids.lock().clone();
        let total = ids.len() as u32;
        if total == 0 {
            continue;
        }

        let mut instances = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(inst) = orchestrator.get_instance(id) {
                instances.push(inst);
            }
        }

        let mut active = 0usize;
        for inst in &instances {
            if is_instance_available(inst.port).await {
                active += 1;
            }
        }
        let ratio = active as f64 / total as f64;

        if active > 0 && ratio > SCALE_UP_THRESHOLD && total < config.max_instances {
            debug!(function = %function_name, active, total, ratio, "scaling up");
            match orchestrator.create_function_instance(&function_name, &config).await {
                Ok(_) => state.last_scale_event.store(now, Ordering::Relaxed),
                Err(e) => warn!(function = %function_name, "scale-up failed: {e}"),
            }
        } else if total > config.min_instances && ratio < SCALE_DOWN_THRESHOLD {
            if let Some(victim) = instances.iter().min_by_key(|i| i.last_used()) {
                debug!(function = %function_name, runtime_id = %victim.runtime_id, "scaling down");
                match orchestrator.stop_function_instance(&victim.runtime_id).await {
                    Ok(_) => state.last_scale_event.store(now, Ordering::Relaxed),
                    Err(e) => warn!(function = %function_name, "scale-down failed: {e}"),
                }
            }
        }
    }
    Ok(())
}
