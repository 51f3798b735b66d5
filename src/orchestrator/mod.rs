//! Orchestrator core: dispatch, instance pooling, invocation forwarding and
//! platform stats, plus the autoscaler and reaper background loops.

mod autoscaler;
mod reaper;

pub use autoscaler::run_autoscaler;
pub use reaper::run_reaper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::executor::{now_epoch, Executor, ExecutorStats, Instance, RuntimeConfig};
use crate::registry::{ExecutionMode, FunctionConfig, FunctionRegistry, RegistryError};
use crate::system::Locker;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("failed to create function instance: {0}")]
    ProvisionFailed(String),
    #[error("function instance unavailable")]
    InstanceUnavailable,
    #[error("function timeout")]
    Timeout,
    #[error("request failed: {0}")]
    Upstream(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Executor(#[from] crate::executor::ExecutorError),
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Per-function load-balancing state: the live instance list, the
/// round-robin cursor, and the last time this function was scaled.
struct LoadBalancingState {
    runtime_ids: Mutex<Vec<String>>,
    round_robin_index: std::sync::atomic::AtomicUsize,
    last_scale_event: AtomicI64,
}

impl LoadBalancingState {
    fn new() -> Self {
        Self {
            runtime_ids: Mutex::new(Vec::new()),
            round_robin_index: std::sync::atomic::AtomicUsize::new(0),
            last_scale_event: AtomicI64::new(0),
        }
    }
}

#[derive(Serialize)]
pub struct FunctionStats {
    pub instances: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}

#[derive(Serialize)]
pub struct PlatformStats {
    pub total_functions: usize,
    pub total_instances: usize,
    pub uptime: i64,
}

#[derive(Serialize)]
pub struct Stats {
    pub platform: PlatformStats,
    pub executors: HashMap<String, ExecutorStats>,
    pub functions: HashMap<String, FunctionStats>,
}

/// Owns the function registry, the two executors, and the dispatch/pooling
/// state; the autoscaler and reaper are free functions that operate on an
/// `Arc<Orchestrator>` from their own background tasks.
pub struct Orchestrator {
    pub registry: FunctionRegistry,
    process_executor: Arc<dyn Executor>,
    container_executor: Arc<dyn Executor>,
    load_balancer: DashMap<String, Arc<LoadBalancingState>>,
    instances: DashMap<String, Arc<Instance>>,
    provision_locks: DashMap<String, Arc<Locker>>,
    start_time: i64,
    min_scale_interval_secs: i64,
}

impl Orchestrator {
    pub fn new(process_executor: Arc<dyn Executor>, container_executor: Arc<dyn Executor>) -> Self {
        Self {
            registry: FunctionRegistry::new(),
            process_executor,
            container_executor,
            load_balancer: DashMap::new(),
            instances: DashMap::new(),
            provision_locks: DashMap::new(),
            start_time: now_epoch(),
            min_scale_interval_secs: 30,
        }
    }

    fn provision_lock(&self, function_name: &str) -> Arc<Locker> {
        self.provision_locks
            .entry(function_name.to_string())
            .or_insert_with(|| Arc::new(Locker::new()))
            .clone()
    }

    fn executor_for(&self, mode: ExecutionMode) -> &Arc<dyn Executor> {
        match mode {
            ExecutionMode::Process => &self.process_executor,
            ExecutionMode::Container => &self.container_executor,
        }
    }

    fn lb_state(&self, function_name: &str) -> Arc<LoadBalancingState> {
        self.load_balancer
            .entry(function_name.to_string())
            .or_insert_with(|| Arc::new(LoadBalancingState::new()))
            .clone()
    }

    /// Dispatch contract: resolve the function, acquire or provision an
    /// instance, forward the request, and update stats.
    pub async fn invoke(
        &self,
        function_name: &str,
        request_data: serde_json::Value,
        headers: HashMap<String, String>,
    ) -> OrchestratorResult<(u16, serde_json::Value)> {
        let function_config = self
            .registry
            .get(function_name)
            .ok_or_else(|| OrchestratorError::FunctionNotFound(function_name.to_string()))?;

        let instance = self
            .get_or_create_instance(function_name, &function_config)
            .await?
            .ok_or_else(|| OrchestratorError::ProvisionFailed("no instance available".into()))?;

        let result = call_instance(instance.port, &request_data, &headers).await;
        let is_error = matches!(&result, Err(_)) || matches!(&result, Ok((code, _)) if *code >= 400);
        instance.record_invocation(is_error);
        self.executor_for(instance.execution_mode).update_last_used(&instance.runtime_id);

        match result {
            Ok((code, body)) => Ok((code, body)),
            Err(e) => Err(e),
        }
    }

    /// Resolve an available instance via round-robin, provisioning a new one
    /// if the function is under its instance cap, else waiting briefly for
    /// one to free up.
    async fn get_or_create_instance(
        &self,
        function_name: &str,
        function_config: &FunctionConfig,
    ) -> OrchestratorResult<Option<Arc<Instance>>> {
        let state = self.lb_state(function_name);

        if let Some(inst) = self.pick_available(&state).await {
            return Ok(Some(inst));
        }

        // Serialize the check-then-create sequence per function so two
        // concurrent callers can't both observe room under max_instances
        // and overshoot it.
        let lock = self.provision_lock(function_name);
        let _permit = lock.acquire().await.map_err(|_| OrchestratorError::InstanceUnavailable)?;

        if let Some(inst) = self.pick_available(&state).await {
            return Ok(Some(inst));
        }

        let current_count = state.runtime_ids.lock().len() as u32;
        if current_count < function_config.max_instances {
            return self
                .create_function_instance(function_name, function_config)
                .await
                .map(Some);
        }

        for _ in 0..10 {
            if let Some(inst) = self.pick_available(&state).await {
                return Ok(Some(inst));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(None)
    }

    async fn pick_available(&self, state: &LoadBalancingState) -> Option<Arc<Instance>> {
        let candidates: Vec<Arc<Instance>> = {
            let ids = state.runtime_ids.lock();
            ids.iter()
                .filter_map(|id| self.instances.get(id).map(|e| e.clone()))
                .collect()
        };

        let mut healthy = Vec::with_capacity(candidates.len());
        for inst in candidates {
            if is_instance_available(inst.port).await {
                healthy.push(inst);
            }
        }

        if healthy.is_empty() {
            return None;
        }

        let idx = state.round_robin_index.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].clone())
    }

    async fn create_function_instance(
        &self,
        function_name: &str,
        function_config: &FunctionConfig,
    ) -> OrchestratorResult<Arc<Instance>> {
        let runtime_id = uuid::Uuid::new_v4().to_string();
        let runtime_config = self.build_runtime_config(function_name, function_config, &runtime_id);

        let executor = self.executor_for(function_config.execution_mode);
        let created_id = executor
            .create_instance(function_name, function_config, runtime_config)
            .await
            .map_err(|e| OrchestratorError::ProvisionFailed(e.to_string()))?;

        let port = executor
            .instance_port(&created_id)
            .ok_or_else(|| OrchestratorError::ProvisionFailed("instance vanished after create".into()))?;

        let instance = Arc::new(Instance::new(
            created_id.clone(),
            function_name.to_string(),
            function_config.execution_mode,
            port,
        ));

        self.instances.insert(created_id.clone(), instance.clone());
        let state = self.lb_state(function_name);
        state.runtime_ids.lock().push(created_id.clone());

        info!(runtime_id = %created_id, function = function_name, mode = %function_config.execution_mode, "provisioned instance");
        Ok(instance)
    }

    fn build_runtime_config(
        &self,
        function_name: &str,
        function_config: &FunctionConfig,
        runtime_id: &str,
    ) -> RuntimeConfig {
        let mut cfg: RuntimeConfig = function_config.environment.clone();
        cfg.insert("RUNTIME_HOST".into(), "0.0.0.0".into());
        cfg.insert(
            "FUNCTION_PATH".into(),
            format!("/tmp/{function_name}.rhai"),
        );
        cfg.insert("FUNCTION_NAME".into(), function_config.handler.clone());
        cfg.insert("FUNCTION_TIMEOUT".into(), function_config.timeout_seconds.to_string());
        cfg.insert("EXECUTION_MODE".into(), function_config.execution_mode.to_string());
        cfg.insert("RUNTIME_ID".into(), runtime_id.to_string());
        cfg.insert("LOG_LEVEL".into(), "info".into());
        cfg.insert("MEMORY_LIMIT".into(), function_config.memory_limit.clone());
        cfg.insert("CPU_LIMIT".into(), function_config.cpu_limit.clone());
        if let Some(code) = self.registry.get_code(function_name) {
            cfg.insert("FUNCTION_SOURCE".into(), code.body);
        }
        cfg
    }

    pub async fn stop_function_instance(&self, runtime_id: &str) -> OrchestratorResult<bool> {
        let Some((_, instance)) = self.instances.remove(runtime_id) else {
            return Ok(false);
        };

        let executor = self.executor_for(instance.execution_mode);
        let stopped = executor.stop_instance(runtime_id).await?;

        if let Some(state) = self.load_balancer.get(&instance.function_name) {
            state.runtime_ids.lock().retain(|id| id != runtime_id);
        }

        Ok(stopped)
    }

    pub async fn delete_function(&self, function_name: &str) -> OrchestratorResult<()> {
        if !self.registry.exists(function_name) {
            return Err(OrchestratorError::FunctionNotFound(function_name.to_string()));
        }

        let ids: Vec<String> = self
            .load_balancer
            .get(function_name)
            .map(|s| s.runtime_ids.lock().clone())
            .unwrap_or_default();

        for id in ids {
            if let Err(e) = self.stop_function_instance(&id).await {
                warn!("failed to stop instance {id} while deleting {function_name}: {e}");
            }
        }

        self.load_balancer.remove(function_name);
        self.registry.remove(function_name);
        Ok(())
    }

    /// Pre-warm every function configured with `min_instances > 0`. Failures
    /// for one function are logged and do not stop pre-warming others.
    pub async fn pre_warm(&self) {
        for function_name in self.registry.list() {
            let Some(config) = self.registry.get(&function_name) else {
                continue;
            };
            if config.min_instances == 0 {
                continue;
            }
            info!(function = %function_name, count = config.min_instances, "pre-warming");
            for _ in 0..config.min_instances {
                if let Err(e) = self.create_function_instance(&function_name, &config).await {
                    warn!(function = %function_name, "pre-warm failed: {e}");
                    break;
                }
            }
        }
    }

    pub async fn stats(&self) -> Stats {
        let mut executors = HashMap::new();
        executors.insert("process".to_string(), self.process_executor.get_stats().await);
        executors.insert("container".to_string(), self.container_executor.get_stats().await);

        let mut functions = HashMap::new();
        for entry in self.load_balancer.iter() {
            let ids = entry.value().runtime_ids.lock().clone();
            let mut total_requests = 0u64;
            let mut total_errors = 0u64;
            for id in &ids {
                if let Some(inst) = self.instances.get(id) {
                    total_requests += inst.request_count();
                    total_errors += inst.error_count();
                }
            }
            functions.insert(
                entry.key().clone(),
                FunctionStats {
                    instances: ids.len(),
                    total_requests,
                    total_errors,
                },
            );
        }

        Stats {
            platform: PlatformStats {
                total_functions: self.registry.list().len(),
                total_instances: self.instances.len(),
                uptime: now_epoch() - self.start_time,
            },
            executors,
            functions,
        }
    }

    pub fn list_instances(&self) -> Vec<Arc<Instance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_instance(&self, runtime_id: &str) -> Option<Arc<Instance>> {
        self.instances.get(runtime_id).map(|e| e.clone())
    }

    /// Drops a runtime_id from the authoritative index and its function's
    /// load-balancing list without touching the executor itself; used by the
    /// reaper once an executor has already torn the instance down.
    fn forget_instance(&self, runtime_id: &str) {
        if let Some((_, instance)) = self.instances.remove(runtime_id) {
            if let Some(state) = self.load_balancer.get(&instance.function_name) {
                state.runtime_ids.lock().retain(|id| id != runtime_id);
            }
        }
    }

    pub async fn shutdown(&self) {
        self.process_executor.shutdown().await;
        self.container_executor.shutdown().await;
    }
}

/// No-op executor used wherever a test only exercises the other mode.
#[cfg(test)]
struct DeadExecutor;

#[cfg(test)]
#[async_trait::async_trait]
impl Executor for DeadExecutor {
    async fn create_instance(
        &self,
        _function_name: &str,
        _function_config: &FunctionConfig,
        _runtime_config: RuntimeConfig,
    ) -> crate::executor::ExecutorResult<String> {
        Err(crate::executor::ExecutorError::Unavailable("no executor configured".into()))
    }
    async fn stop_instance(&self, _runtime_id: &str) -> crate::executor::ExecutorResult<bool> {
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
    async fn get_stats(&self) -> ExecutorStats {
        ExecutorStats {
            executor_type: "none".into(),
            platform: "none".into(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU16;
    use tokio::net::TcpListener;

    /// Spawns a tiny real HTTP server per "instance" so dispatch can probe
    /// `/health` and POST `/` exactly as it would against the real runtime
    /// host, without depending on the `rhai`-backed reference binary.
    struct FakeExecutor {
        next_port: AtomicU16,
        instances: DashMap<String, u16>,
    }

    impl FakeExecutor {
        fn new(base_port: u16) -> Self {
            Self {
                next_port: AtomicU16::new(base_port),
                instances: DashMap::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl Executor for FakeExecutor {
        async fn create_instance(
            &self,
            _function_name: &str,
            _function_config: &FunctionConfig,
            _runtime_config: RuntimeConfig,
        ) -> crate::executor::ExecutorResult<String> {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|e| crate::executor::ExecutorError::StartFailed(e.to_string()))?;

            let app = axum::Router::new()
                .route("/health", axum::routing::get(|| async { "ok" }))
                .route(
                    "/",
                    axum::routing::post(|body: axum::body::Bytes| async move {
                        let parsed: serde_json::Value = serde_json::from_slice(&body)
                            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&body).into_owned()));
                        axum::Json(serde_json::json!({ "echo": parsed }))
                    }),
                );
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });

            let runtime_id = uuid::Uuid::new_v4().to_string();
            self.instances.insert(runtime_id.clone(), port);
            Ok(runtime_id)
        }

        async fn stop_instance(&self, runtime_id: &str) -> crate::executor::ExecutorResult<bool> {
            Ok(self.instances.remove(runtime_id).is_some())
        }

        async fn cleanup_expired(&self, _ttl_seconds: u64) -> Vec<String> {
            Vec::new()
        }

        fn update_last_used(&self, _runtime_id: &str) {}

        fn contains(&self, runtime_id: &str) -> bool {
            self.instances.contains_key(runtime_id)
        }

        fn instance_port(&self, runtime_id: &str) -> Option<u16> {
            self.instances.get(runtime_id).map(|e| *e.value())
        }

        async fn get_stats(&self) -> ExecutorStats {
            ExecutorStats {
                executor_type: "fake".into(),
                platform: "test".into(),
                total_instances: self.instances.len(),
                running_instances: self.instances.len(),
                memory_usage_bytes: 0,
                avg_cold_start_ms: 0,
                supported_features: Vec::new(),
            }
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn shutdown(&self) {
            self.instances.clear();
        }
    }

    fn test_orchestrator(base_port: u16) -> Orchestrator {
        Orchestrator::new(Arc::new(FakeExecutor::new(base_port)), Arc::new(DeadExecutor))
    }

    fn echo_config(name: &str, max_instances: u32) -> FunctionConfig {
        let mut cfg = FunctionConfig::new(name);
        cfg.max_instances = max_instances;
        cfg
    }

    #[tokio::test]
    async fn invoke_unknown_function_is_not_found() {
        let orch = test_orchestrator(20100);
        let err = orch
            .invoke("missing", serde_json::json!({}), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::FunctionNotFound(_)));
    }

    #[tokio::test]
    async fn happy_path_dispatch_provisions_and_forwards() {
        let orch = test_orchestrator(20110);
        orch.registry
            .register(echo_config("echo", 2), crate::registry::FunctionCode { body: String::new() })
            .unwrap();

        let (status, body) = orch
            .invoke("echo", serde_json::json!("hello"), HashMap::new())
            .await
            .unwrap();

        assert_eq!(status, 200);
        assert_eq!(body["echo"], serde_json::json!("hello"));
        assert_eq!(orch.list_instances().len(), 1);

        let stats = orch.stats().await;
        assert_eq!(stats.functions["echo"].total_requests, 1);
        assert_eq!(stats.functions["echo"].total_errors, 0);
    }

    #[tokio::test]
    async fn delete_cascade_removes_all_instances() {
        let orch = test_orchestrator(20120);
        orch.registry
            .register(echo_config("f", 3), crate::registry::FunctionCode { body: String::new() })
            .unwrap();

        for _ in 0..3 {
            orch.invoke("f", serde_json::json!("x"), HashMap::new()).await.unwrap();
            // Force a fresh instance each time by filling the pool directly.
            let config = orch.registry.get("f").unwrap();
            orch.create_function_instance("f", &config).await.unwrap();
        }

        assert!(orch.delete_function("f").await.is_ok());
        assert!(orch.registry.get("f").is_none());
        assert!(orch.list_instances().is_empty());

        let err = orch.delete_function("f").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::FunctionNotFound(_)));
    }

    #[tokio::test]
    async fn max_instances_zero_yields_no_instance() {
        let orch = test_orchestrator(20130);
        orch.registry
            .register(echo_config("capped", 0), crate::registry::FunctionCode { body: String::new() })
            .unwrap();

        let err = orch
            .invoke("capped", serde_json::json!({}), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProvisionFailed(_)));
    }

    #[tokio::test]
    async fn stop_function_instance_is_idempotent() {
        let orch = test_orchestrator(20140);
        orch.registry
            .register(echo_config("g", 1), crate::registry::FunctionCode { body: String::new() })
            .unwrap();
        let config = orch.registry.get("g").unwrap();
        let instance = orch.create_function_instance("g", &config).await.unwrap();

        assert!(orch.stop_function_instance(&instance.runtime_id).await.unwrap());
        assert!(!orch.stop_function_instance(&instance.runtime_id).await.unwrap());
    }
}

async fn is_instance_available(port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/health");
    let client = reqwest::Client::new();
    match tokio::time::timeout(Duration::from_secs(2), client.get(&url).send()).await {
        Ok(Ok(resp)) => resp.status().is_success(),
        _ => false,
    }
}

async fn call_instance(
    port: u16,
    request_data: &serde_json::Value,
    headers: &HashMap<String, String>,
) -> OrchestratorResult<(u16, serde_json::Value)> {
    let url = format!("http://127.0.0.1:{port}/");
    let client = reqwest::Client::new();

    let mut req = client.post(&url).json(request_data);
    for (k, v) in headers {
        req = req.header(k, v);
    }

    let response = match tokio::time::timeout(Duration::from_secs(30), req.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) if e.is_timeout() => return Err(OrchestratorError::Timeout),
        Ok(Err(e)) if e.is_connect() => return Err(OrchestratorError::InstanceUnavailable),
        Ok(Err(e)) => return Err(OrchestratorError::Upstream(e.to_string())),
        Err(_) => return Err(OrchestratorError::Timeout),
    };

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| OrchestratorError::Upstream(e.to_string()))?;
    let body = serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({ "result": text }));

    Ok((status, body))
}
