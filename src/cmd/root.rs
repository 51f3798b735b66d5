//! Main daemon command - starts the daemon server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use faasd::config::Configuration;
use faasd::executor::{ContainerExecutor, Executor, ProcessExecutor};
use faasd::orchestrator::{run_autoscaler, run_reaper, Orchestrator};
use faasd::router::{self, AppState};

/// Run the main daemon.
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    info!("Configuration loaded successfully");
    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Function directory: {}", config.system.function_directory.display());

    let process_executor: Arc<dyn Executor> = Arc::new(ProcessExecutor::new(config.process.clone()));
    let container_executor: Arc<dyn Executor> = match ContainerExecutor::new(config.docker.clone()) {
        Ok(executor) => Arc::new(executor),
        Err(e) => {
            warn!("container executor unavailable, container-mode functions will fail to provision: {e}");
            Arc::new(UnavailableExecutor)
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(process_executor, container_executor));

    info!("Pre-warming functions with configured minimum instances...");
    orchestrator.pre_warm().await;

    let shutdown_token = CancellationToken::new();

    let autoscaler_orchestrator = orchestrator.clone();
    let autoscaler_token = shutdown_token.clone();
    let autoscale_interval_secs = config.system.autoscale_interval_seconds;
    tokio::spawn(run_autoscaler(autoscaler_orchestrator, autoscale_interval_secs, autoscaler_token));
    info!("Started autoscaler (tick every {}s)", autoscale_interval_secs);

    let reaper_orchestrator = orchestrator.clone();
    let reaper_token = shutdown_token.clone();
    let ttl_seconds = config.system.warm_instance_ttl_seconds;
    let reaper_interval_secs = config.system.reaper_interval_seconds;
    tokio::spawn(run_reaper(reaper_orchestrator, ttl_seconds, reaper_interval_secs, reaper_token));
    info!("Started reaper (tick every {}s)", reaper_interval_secs);

    let state = AppState {
        orchestrator: orchestrator.clone(),
        config: config.clone(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .expect("invalid bind address");

    let shutdown_orchestrator = orchestrator.clone();
    let shutdown_token_clone = shutdown_token.clone();
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        warn!("received shutdown signal, stopping...");

        shutdown_token_clone.cancel();
        shutdown_orchestrator.shutdown().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    if config.api.ssl.enabled {
        info!("Starting HTTPS server on {} (SSL enabled)", bind_addr);

        let tls_config = RustlsConfig::from_pem_file(&config.api.ssl.cert, &config.api.ssl.key)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load TLS config: {e}"))?;

        axum_server::bind_rustls(bind_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        info!("Starting HTTP server on {} (SSL disabled)", bind_addr);

        axum_server::bind(bind_addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    info!("Daemon stopped");
    Ok(())
}

/// Stand-in executor used when the Docker socket can't be reached at
/// startup; every call fails rather than panicking the daemon.
struct UnavailableExecutor;

#[async_trait::async_trait]
impl Executor for UnavailableExecutor {
    async fn create_instance(
        &self,
        _function_name: &str,
        _function_config: &faasd::registry::FunctionConfig,
        _runtime_config: faasd::executor::RuntimeConfig,
    ) -> faasd::executor::ExecutorResult<String> {
        Err(faasd::executor::ExecutorError::Unavailable(
            "container executor not initialized".into(),
        ))
    }

    async fn stop_instance(&self, _runtime_id: &str) -> faasd::executor::ExecutorResult<bool> {
        Ok(false)
    }

    async fn cleanup_expired(&self, _ttl_seconds: u64) -> Vec<String> {
        Vec::new()
    }

    fn update_last_used(&self, _runtime_id: &str) {}

    fn contains(&self, _runtime_id: &str) -> bool {
        false
    }

    fn instance_port(&self, _runtime_id: &str) -> Option<u16> {
        None
    }

    async fn get_stats(&self) -> faasd::executor::ExecutorStats {
        faasd::executor::ExecutorStats {
            executor_type: "container".into(),
            platform: "docker".into(),
            total_instances: 0,
            running_instances: 0,
            memory_usage_bytes: 0,
            avg_cold_start_ms: 0,
            supported_features: Vec::new(),
        }
    }

    async fn health_check(&self) -> bool {
        false
    }

    async fn shutdown(&self) {}
}
