//! Reaper: periodically evicts idle instances past their TTL and reconciles
//! tracking state against what the executors actually still hold.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Orchestrator;

pub async fn run_reaper(
    orchestrator: Arc<Orchestrator>,
    ttl_seconds: u64,
    tick_interval_secs: u64,
    shutdown: CancellationToken,
) {
    info!("reaper started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(tick_interval_secs)) => {
                sweep(&orchestrator, ttl_seconds).await;
            }
        }
    }
    info!("reaper stopped");
}

async fn sweep(orchestrator: &Arc<Orchestrator>, ttl_seconds: u64) {
    let process_reaped = orchestrator.process_executor.cleanup_expired(ttl_seconds).await;
    let container_reaped = orchestrator.container_executor.cleanup_expired(ttl_seconds).await;

    for runtime_id in process_reaped.iter().chain(container_reaped.iter()) {
        orchestrator.forget_instance(runtime_id);
    }
    if !process_reaped.is_empty() || !container_reaped.is_empty() {
        debug!(
            process = process_reaped.len(),
            container = container_reaped.len(),
            "reaped expired instances"
        );
    }

    cleanup_orphaned_tracking(orchestrator).await;
}

/// Drops tracking entries whose runtime_id no longer exists in the owning
/// executor — e.g. a container that died outside our control.
async fn cleanup_orphaned_tracking(orchestrator: &Arc<Orchestrator>) {
    let mut orphaned = Vec::new();
    for inst in orchestrator.list_instances() {
        let executor = orchestrator.executor_for(inst.execution_mode);
        if !executor.contains(&inst.runtime_id) {
            orphaned.push(inst.runtime_id.clone());
        }
    }

    if !orphaned.is_empty() {
        debug!(count = orphaned.len(), "reconciling orphaned tracking entries");
    }
    for runtime_id in orphaned {
        orchestrator.forget_instance(&runtime_id);
    }
}
