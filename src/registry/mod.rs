//! Function registry: the in-memory catalog of registered functions and their source.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution mode a function runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Process,
    Container,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Process
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Process => write!(f, "process"),
            ExecutionMode::Container => write!(f, "container"),
        }
    }
}

/// How aggressively a sandbox is isolated from its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Default,
    Strict,
    Minimal,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Default
    }
}

/// Filesystem exposure granted to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemAccess {
    Readonly,
    Writable,
    Minimal,
}

impl Default for FilesystemAccess {
    fn default() -> Self {
        FilesystemAccess::Readonly
    }
}

/// Configuration for a single registered function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub name: String,

    #[serde(default = "default_handler")]
    pub handler: String,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_memory")]
    pub memory_limit: String,

    #[serde(default = "default_cpu")]
    pub cpu_limit: String,

    #[serde(default)]
    pub min_instances: u32,

    #[serde(default = "default_max_instances")]
    pub max_instances: u32,

    #[serde(default)]
    pub isolation_level: IsolationLevel,

    #[serde(default = "default_true")]
    pub network_access: bool,

    #[serde(default)]
    pub filesystem_access: FilesystemAccess,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
}

fn default_handler() -> String {
    "handle".into()
}
fn default_timeout() -> u64 {
    30
}
fn default_memory() -> String {
    "256Mi".into()
}
fn default_cpu() -> String {
    "100m".into()
}
fn default_max_instances() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_scale_factor() -> f64 {
    1.5
}

impl FunctionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: default_handler(),
            execution_mode: ExecutionMode::default(),
            timeout_seconds: default_timeout(),
            memory_limit: default_memory(),
            cpu_limit: default_cpu(),
            min_instances: 0,
            max_instances: default_max_instances(),
            isolation_level: IsolationLevel::default(),
            network_access: true,
            filesystem_access: FilesystemAccess::default(),
            environment: HashMap::new(),
            dependencies: Vec::new(),
            scale_factor: default_scale_factor(),
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidConfig("name must not be empty".into()));
        }
        if self.max_instances < self.min_instances {
            return Err(RegistryError::InvalidConfig(
                "max_instances must be >= min_instances".into(),
            ));
        }
        if self.scale_factor < 1.0 {
            return Err(RegistryError::InvalidConfig(
                "scale_factor must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// The function's source blob, owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCode {
    pub body: String,
}

#[derive(Debug, Clone)]
struct FunctionEntry {
    config: FunctionConfig,
    code: FunctionCode,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("function not found: {0}")]
    NotFound(String),
    #[error("function already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid function config: {0}")]
    InvalidConfig(String),
}

/// In-memory catalog of registered functions. Purely in-process: persistent
/// function storage is out of scope for this daemon.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        config: FunctionConfig,
        code: FunctionCode,
    ) -> Result<(), RegistryError> {
        config.validate()?;
        if self.functions.contains_key(&config.name) {
            return Err(RegistryError::AlreadyExists(config.name));
        }
        self.functions
            .insert(config.name.clone(), FunctionEntry { config, code });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<FunctionConfig> {
        self.functions.get(name).map(|e| e.config.clone())
    }

    pub fn get_code(&self, name: &str) -> Option<FunctionCode> {
        self.functions.get(name).map(|e| e.code.clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.functions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn update(
        &self,
        name: &str,
        new_config: Option<FunctionConfig>,
        new_code: Option<FunctionCode>,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .functions
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if let Some(cfg) = new_config {
            cfg.validate()?;
            entry.config = cfg;
        }
        if let Some(code) = new_code {
            entry.code = code;
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_get_remove_roundtrip() {
        let reg = FunctionRegistry::new();
        let cfg = FunctionConfig::new("echo");
        reg.register(cfg, FunctionCode { body: "fn handle() {}".into() })
            .unwrap();

        assert!(reg.exists("echo"));
        assert_eq!(reg.get("echo").unwrap().name, "echo");
        assert!(reg.remove("echo"));
        assert!(!reg.exists("echo"));
    }

    #[test]
    fn register_twice_fails() {
        let reg = FunctionRegistry::new();
        let cfg = FunctionConfig::new("dup");
        reg.register(cfg.clone(), FunctionCode { body: String::new() })
            .unwrap();
        let err = reg
            .register(cfg, FunctionCode { body: String::new() })
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
    }

    #[test]
    fn invalid_config_rejected() {
        let reg = FunctionRegistry::new();
        let mut cfg = FunctionConfig::new("bad");
        cfg.max_instances = 0;
        cfg.min_instances = 5;
        let err = reg
            .register(cfg, FunctionCode { body: String::new() })
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
    }
}
