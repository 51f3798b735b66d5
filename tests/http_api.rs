//! End-to-end tests against the real HTTP facade, talking to a fake
//! in-process executor standing in for real sandboxes.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use faasd::config::Configuration;
use faasd::executor::{Executor, ExecutorError, ExecutorResult, ExecutorStats, RuntimeConfig};
use faasd::orchestrator::Orchestrator;
use faasd::registry::FunctionConfig;
use faasd::router::{self, AppState};
use tokio::net::TcpListener;

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

#[async_trait]
impl Executor for FakeExecutor {
    async fn create_instance(
        &self,
        _function_name: &str,
        _function_config: &FunctionConfig,
        _runtime_config: RuntimeConfig,
    ) -> ExecutorResult<String> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| ExecutorError::StartFailed(e.to_string()))?;

        let app = axum::Router::new()
            .route("/health", axum::routing::get(|| async { "ok" }))
            .route(
                "/",
                axum::routing::post(|body: axum::body::Bytes| async move {
                    let parsed: serde_json::Value = serde_json::from_slice(&body)
                        .unwrap_or(serde_json::Value::Null);
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

    async fn stop_instance(&self, runtime_id: &str) -> ExecutorResult<bool> {
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

struct NullExecutor;

#[async_trait]
impl Executor for NullExecutor {
    async fn create_instance(
        &self,
        _function_name: &str,
        _function_config: &FunctionConfig,
        _runtime_config: RuntimeConfig,
    ) -> ExecutorResult<String> {
        Err(ExecutorError::Unavailable("not configured".into()))
    }
    async fn stop_instance(&self, _runtime_id: &str) -> ExecutorResult<bool> {
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

async fn spawn_server(base_port: u16, facade_port: u16) {
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(FakeExecutor::new(base_port)),
        Arc::new(NullExecutor),
    ));
    let config: Configuration = toml::from_str("").unwrap();
    let state = AppState {
        orchestrator,
        config: Arc::new(config),
    };
    let app = router::build_router(state);

    let listener = TcpListener::bind(("127.0.0.1", facade_port)).await.unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    // Give the listener a moment to come up before the first request.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    spawn_server(21000, 21500).await;
    let resp = reqwest::get("http://127.0.0.1:21500/health").await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn register_list_get_delete_function_lifecycle() {
    spawn_server(21010, 21510).await;
    let client = reqwest::Client::new();

    let register = client
        .post("http://127.0.0.1:21510/functions")
        .json(&serde_json::json!({ "name": "demo", "code": "fn handle(r) { r }" }))
        .send()
        .await
        .unwrap();
    assert_eq!(register.status(), 201);

    let list = client.get("http://127.0.0.1:21510/functions").send().await.unwrap();
    assert_eq!(list.status(), 200);
    let list_body: serde_json::Value = list.json().await.unwrap();
    assert_eq!(list_body["functions"].as_array().unwrap().len(), 1);

    let get = client.get("http://127.0.0.1:21510/functions/demo").send().await.unwrap();
    assert_eq!(get.status(), 200);

    let delete = client
        .delete("http://127.0.0.1:21510/functions/demo")
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status(), 200);

    let missing = client.get("http://127.0.0.1:21510/functions/demo").send().await.unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn invoke_dispatches_and_updates_stats() {
    spawn_server(21020, 21520).await;
    let client = reqwest::Client::new();

    client
        .post("http://127.0.0.1:21520/functions")
        .json(&serde_json::json!({ "name": "echo", "code": "" }))
        .send()
        .await
        .unwrap();

    let invoke = client
        .post("http://127.0.0.1:21520/invoke/echo")
        .json(&serde_json::json!({ "msg": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invoke.status(), 200);

    let stats = client
        .get("http://127.0.0.1:21520/stats")
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(stats["functions"]["echo"]["total_requests"].as_u64(), Some(1));

    let instances = client
        .get("http://127.0.0.1:21520/instances")
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(instances["instances"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invoke_unknown_function_is_404() {
    spawn_server(21030, 21530).await;
    let resp = reqwest::Client::new()
        .post("http://127.0.0.1:21530/invoke/nope")
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn stop_unknown_instance_is_404() {
    spawn_server(21040, 21540).await;
    let resp = reqwest::Client::new()
        .delete("http://127.0.0.1:21540/instances/does-not-exist")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
