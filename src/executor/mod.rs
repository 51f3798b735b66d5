//! Executor interface: the uniform contract implemented by the process and
//! container sandbox backends.

mod container;
mod process;

pub use container::ContainerExecutor;
pub use process::ProcessExecutor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::registry::{ExecutionMode, FunctionConfig};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start sandbox: {0}")]
    StartFailed(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("executor unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// A live sandbox instance, shared between the orchestrator's indices and
/// the owning executor.
#[derive(Debug)]
pub struct Instance {
    pub runtime_id: String,
    pub function_name: String,
    pub execution_mode: ExecutionMode,
    pub port: u16,
    pub created_at: i64,
    last_used: AtomicI64,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl Instance {
    pub fn new(runtime_id: String, function_name: String, execution_mode: ExecutionMode, port: u16) -> Self {
        let now = now_epoch();
        Self {
            runtime_id,
            function_name,
            execution_mode,
            port,
            created_at: now,
            last_used: AtomicI64::new(now),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn last_used(&self) -> i64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_used.store(now_epoch(), Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn record_invocation(&self, is_error: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    pub fn idle_seconds(&self) -> i64 {
        now_epoch() - self.last_used()
    }
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Per-executor statistics surfaced through `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub executor_type: String,
    pub platform: String,
    pub total_instances: usize,
    pub running_instances: usize,
    pub memory_usage_bytes: u64,
    pub avg_cold_start_ms: u64,
    pub supported_features: Vec<String>,
}

/// Environment passed to a freshly created sandbox: RUNTIME_PORT, FUNCTION_PATH,
/// and the rest of the wire contract documented for the runtime host.
pub type RuntimeConfig = HashMap<String, String>;

/// Allocates unique loopback ports within a configured range; unlike the
/// source prototype's unchecked random pick, this tracks what's in use so
/// two live instances can never collide.
pub(crate) struct PortAllocator {
    range: std::ops::Range<u16>,
    in_use: parking_lot::Mutex<std::collections::HashSet<u16>>,
}

impl PortAllocator {
    pub(crate) fn new(start: u16, end: u16) -> Self {
        Self {
            range: start..end,
            in_use: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub(crate) fn allocate(&self) -> ExecutorResult<u16> {
        let mut in_use = self.in_use.lock();
        for port in self.range.clone() {
            if !in_use.contains(&port) {
                in_use.insert(port);
                return Ok(port);
            }
        }
        Err(ExecutorError::StartFailed("no free ports in range".into()))
    }

    pub(crate) fn release(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }
}

/// Uniform contract implemented independently by the process and container
/// backends; the orchestrator never distinguishes between them beyond this
/// trait object.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn create_instance(
        &self,
        function_name: &str,
        function_config: &FunctionConfig,
        runtime_config: RuntimeConfig,
    ) -> ExecutorResult<String>;

    async fn stop_instance(&self, runtime_id: &str) -> ExecutorResult<bool>;

    async fn cleanup_expired(&self, ttl_seconds: u64) -> Vec<String>;

    fn update_last_used(&self, runtime_id: &str);

    fn contains(&self, runtime_id: &str) -> bool;

    fn instance_port(&self, runtime_id: &str) -> Option<u16>;

    async fn get_stats(&self) -> ExecutorStats;

    async fn health_check(&self) -> bool;

    async fn shutdown(&self);
}

/// Parses a memory limit string (`"256Mi"`, `"512k"`, `"1073741824"`) into bytes.
pub fn parse_memory_limit(limit: &str) -> Option<u64> {
    let limit = limit.to_lowercase();
    let limit = limit.trim();
    if limit.is_empty() {
        return None;
    }

    const SUFFIXES: &[(&str, u64)] = &[
        ("ki", 1024),
        ("k", 1024),
        ("mi", 1024 * 1024),
        ("m", 1024 * 1024),
        ("gi", 1024 * 1024 * 1024),
        ("g", 1024 * 1024 * 1024),
    ];

    for (suffix, multiplier) in SUFFIXES {
        if let Some(stripped) = limit.strip_suffix(suffix) {
            return stripped.trim().parse::<u64>().ok().map(|v| v * multiplier);
        }
    }

    limit.parse::<u64>().ok()
}

/// Parses a CPU limit (`"100m"` millicores or `"1.5"` cores) into a cgroup v2
/// `cpu.max` quota (microseconds per 100ms period).
pub fn parse_cpu_quota(limit: &str) -> Option<u64> {
    let limit = limit.trim();
    if limit.is_empty() {
        return None;
    }
    if let Some(stripped) = limit.strip_suffix('m') {
        let millicores: u64 = stripped.parse().ok()?;
        Some(millicores * 100)
    } else {
        let cores: f64 = limit.parse().ok()?;
        Some((cores * 100_000.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_parsing() {
        assert_eq!(parse_memory_limit("256Mi"), Some(256 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("512k"), Some(512 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit(""), None);
        assert_eq!(parse_memory_limit("garbage"), None);
    }

    #[test]
    fn cpu_quota_parsing() {
        assert_eq!(parse_cpu_quota("100m"), Some(10_000));
        assert_eq!(parse_cpu_quota("1"), Some(100_000));
        assert_eq!(parse_cpu_quota("1.5"), Some(150_000));
        assert_eq!(parse_cpu_quota(""), None);
    }

    #[test]
    fn instance_counters() {
        let inst = Instance::new("r1".into(), "fn".into(), ExecutionMode::Process, 9001);
        assert_eq!(inst.request_count(), 0);
        inst.record_invocation(false);
        inst.record_invocation(true);
        assert_eq!(inst.request_count(), 2);
        assert_eq!(inst.error_count(), 1);
    }
}
