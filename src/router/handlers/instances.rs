use axum::{extract::{Path, State}, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

use crate::error::{DaemonError, Result};
use crate::router::AppState;

#[derive(Serialize)]
struct InstanceView {
    runtime_id: String,
    function_name: String,
    execution_mode: crate::registry::ExecutionMode,
    port: u16,
    created_at: i64,
    last_used: i64,
    request_count: u64,
    error_count: u64,
}

pub async fn list_instances(State(state): State<AppState>) -> Json<serde_json::Value> {
    let instances: Vec<InstanceView> = state
        .orchestrator
        .list_instances()
        .iter()
        .map(|i| InstanceView {
            runtime_id: i.runtime_id.clone(),
            function_name: i.function_name.clone(),
            execution_mode: i.execution_mode,
            port: i.port,
            created_at: i.created_at,
            last_used: i.last_used(),
            request_count: i.request_count(),
            error_count: i.error_count(),
        })
        .collect();
    Json(json!({ "instances": instances }))
}

pub async fn stop_instance(
    State(state): State<AppState>,
    Path(runtime_id): Path<String>,
) -> Result<impl IntoResponse> {
    let stopped = state.orchestrator.stop_function_instance(&runtime_id).await?;
    if !stopped {
        return Err(DaemonError::InstanceNotFound(runtime_id));
    }
    Ok(Json(json!({ "runtime_id": runtime_id, "stopped": true })))
}
