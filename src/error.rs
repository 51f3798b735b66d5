//! Crate-wide error type and its HTTP mapping for the management facade.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::orchestrator::OrchestratorError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Function {0} not found")]
    FunctionNotFound(String),

    #[error("Failed to create function instance")]
    ProvisionFailed,

    #[error("Failed to create function instance: {0}")]
    SandboxStartFailed(String),

    #[error("Function instance unavailable")]
    UpstreamUnavailable,

    #[error("Function timeout")]
    UpstreamTimeout,

    #[error("Request failed: {0}")]
    UpstreamProtocol(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for DaemonError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(name) => DaemonError::FunctionNotFound(name),
            RegistryError::AlreadyExists(name) => {
                DaemonError::ConfigInvalid(format!("function already exists: {name}"))
            }
            RegistryError::InvalidConfig(msg) => DaemonError::ConfigInvalid(msg),
        }
    }
}

impl From<ExecutorError> for DaemonError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::StartFailed(msg) => DaemonError::SandboxStartFailed(msg),
            ExecutorError::NotFound(id) => DaemonError::InstanceNotFound(id),
            ExecutorError::Unavailable(msg) => DaemonError::Internal(msg),
            ExecutorError::Io(e) => DaemonError::Internal(e.to_string()),
        }
    }
}

impl From<OrchestratorError> for DaemonError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::FunctionNotFound(name) => DaemonError::FunctionNotFound(name),
            OrchestratorError::ProvisionFailed(reason) => {
                tracing::debug!("provision failed: {reason}");
                DaemonError::ProvisionFailed
            }
            OrchestratorError::InstanceUnavailable => DaemonError::UpstreamUnavailable,
            OrchestratorError::Timeout => DaemonError::UpstreamTimeout,
            OrchestratorError::Upstream(msg) => DaemonError::UpstreamProtocol(msg),
            OrchestratorError::InstanceNotFound(id) => DaemonError::InstanceNotFound(id),
            OrchestratorError::Registry(e) => e.into(),
            OrchestratorError::Executor(e) => e.into(),
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::FunctionNotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::ProvisionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::SandboxStartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::UpstreamTimeout => StatusCode::REQUEST_TIMEOUT,
            DaemonError::UpstreamProtocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            DaemonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
