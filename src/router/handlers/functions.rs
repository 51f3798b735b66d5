use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{DaemonError, Result};
use crate::registry::{FunctionCode, FunctionConfig};
use crate::router::AppState;

#[derive(Deserialize)]
pub struct RegisterFunctionRequest {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub config: Option<FunctionConfigPatch>,
}

#[derive(Deserialize)]
pub struct UpdateFunctionRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub config: Option<FunctionConfigPatch>,
}

/// Partial function config accepted from clients; unset fields keep defaults
/// (registration) or the existing value (update).
#[derive(Deserialize, Default)]
pub struct FunctionConfigPatch {
    pub handler: Option<String>,
    pub execution_mode: Option<crate::registry::ExecutionMode>,
    pub timeout_seconds: Option<u64>,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub min_instances: Option<u32>,
    pub max_instances: Option<u32>,
    pub isolation_level: Option<crate::registry::IsolationLevel>,
    pub network_access: Option<bool>,
    pub filesystem_access: Option<crate::registry::FilesystemAccess>,
    pub environment: Option<std::collections::HashMap<String, String>>,
    pub dependencies: Option<Vec<String>>,
    pub scale_factor: Option<f64>,
}

fn apply_patch(mut config: FunctionConfig, patch: FunctionConfigPatch) -> FunctionConfig {
    if let Some(v) = patch.handler {
        config.handler = v;
    }
    if let Some(v) = patch.execution_mode {
        config.execution_mode = v;
    }
    if let Some(v) = patch.timeout_seconds {
        config.timeout_seconds = v;
    }
    if let Some(v) = patch.memory_limit {
        config.memory_limit = v;
    }
    if let Some(v) = patch.cpu_limit {
        config.cpu_limit = v;
    }
    if let Some(v) = patch.min_instances {
        config.min_instances = v;
    }
    if let Some(v) = patch.max_instances {
        config.max_instances = v;
    }
    if let Some(v) = patch.isolation_level {
        config.isolation_level = v;
    }
    if let Some(v) = patch.network_access {
        config.network_access = v;
    }
    if let Some(v) = patch.filesystem_access {
        config.filesystem_access = v;
    }
    if let Some(v) = patch.environment {
        config.environment = v;
    }
    if let Some(v) = patch.dependencies {
        config.dependencies = v;
    }
    if let Some(v) = patch.scale_factor {
        config.scale_factor = v;
    }
    config
}

pub async fn list_functions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let names = state.orchestrator.registry.list();
    let functions: Vec<_> = names
        .iter()
        .filter_map(|name| state.orchestrator.registry.get(name))
        .collect();
    Json(json!({ "functions": functions }))
}

pub async fn get_function(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
) -> Result<Json<FunctionConfig>> {
    state
        .orchestrator
        .registry
        .get(&function_name)
        .map(Json)
        .ok_or_else(|| DaemonError::FunctionNotFound(function_name))
}

pub async fn register_function(
    State(state): State<AppState>,
    Json(req): Json<RegisterFunctionRequest>,
) -> Result<impl IntoResponse> {
    let mut config = FunctionConfig::new(req.name.clone());
    if let Some(patch) = req.config {
        config = apply_patch(config, patch);
    }
    state
        .orchestrator
        .registry
        .register(config, FunctionCode { body: req.code })?;
    Ok((StatusCode::CREATED, Json(json!({ "name": req.name }))))
}

pub async fn update_function(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
    Json(req): Json<UpdateFunctionRequest>,
) -> Result<impl IntoResponse> {
    let current = state
        .orchestrator
        .registry
        .get(&function_name)
        .ok_or_else(|| DaemonError::FunctionNotFound(function_name.clone()))?;

    let new_config = req.config.map(|patch| apply_patch(current, patch));
    let new_code = req.code.map(|body| FunctionCode { body });

    state
        .orchestrator
        .registry
        .update(&function_name, new_config, new_code)?;
    Ok(Json(json!({ "name": function_name })))
}

pub async fn delete_function(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
) -> Result<impl IntoResponse> {
    state.orchestrator.delete_function(&function_name).await?;
    Ok(Json(json!({ "name": function_name, "deleted": true })))
}
