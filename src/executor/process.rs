//! Process executor: sandboxes realized as native OS processes using Linux
//! namespaces, cgroups v2, and capability drops when available, degrading
//! gracefully to a plain child process elsewhere.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::ProcessConfiguration;
use crate::registry::{FilesystemAccess, FunctionConfig, IsolationLevel};

use super::{Executor, ExecutorError, ExecutorResult, ExecutorStats, Instance, PortAllocator, RuntimeConfig};

struct ProcessHandle {
    instance: Arc<Instance>,
    child: Mutex<Child>,
    temp_dir: tempfile::TempDir,
    cgroup_path: Option<std::path::PathBuf>,
}

pub struct ProcessExecutor {
    config: ProcessConfiguration,
    instances: DashMap<String, ProcessHandle>,
    ports: PortAllocator,
}

impl ProcessExecutor {
    pub fn new(config: ProcessConfiguration) -> Self {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        if cfg!(target_os = "linux") {
            if let Err(e) = std::fs::create_dir_all(&config.cgroup_root) {
                warn!("cannot create faas cgroup root, resource limits disabled: {e}");
            }
        }
        Self {
            config,
            instances: DashMap::new(),
            ports,
        }
    }

    fn create_cgroup(&self, runtime_id: &str, memory_limit: &str, cpu_limit: &str) -> Option<std::path::PathBuf> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let path = self.config.cgroup_root.join(runtime_id);
        if std::fs::create_dir_all(&path).is_err() {
            return None;
        }
        if let Some(bytes) = super::parse_memory_limit(memory_limit) {
            let _ = std::fs::write(path.join("memory.max"), bytes.to_string());
        }
        if let Some(quota) = super::parse_cpu_quota(cpu_limit) {
            let _ = std::fs::write(path.join("cpu.max"), format!("{quota} 100000"));
        }
        Some(path)
    }

    fn add_to_cgroup(path: &std::path::Path, pid: u32) {
        if let Err(e) = std::fs::write(path.join("cgroup.procs"), pid.to_string()) {
            warn!("failed to add pid {pid} to cgroup {}: {e}", path.display());
        }
    }

    fn cleanup_cgroup(path: &std::path::Path) {
        let _ = std::fs::remove_dir(path);
    }

    /// Builds the `unshare`/`capsh`/`chroot` prefix for `strict` isolation,
    /// degrading to an empty prefix on non-Linux platforms.
    fn isolation_prefix(&self, config: &FunctionConfig, temp_dir: &std::path::Path) -> Vec<String> {
        if config.isolation_level != IsolationLevel::Strict || !cfg!(target_os = "linux") {
            return Vec::new();
        }

        let mut prefix = Vec::new();
        let ns_flags: Vec<&str> = self
            .config
            .namespaces
            .iter()
            .filter_map(|ns| match ns.as_str() {
                "pid" => Some("--pid"),
                "mount" => Some("--mount"),
                "user" => Some("--user"),
                "network" => Some("--net"),
                "ipc" => Some("--ipc"),
                "uts" => Some("--uts"),
                _ => None,
            })
            .collect();
        if !ns_flags.is_empty() {
            prefix.push("unshare".to_string());
            prefix.extend(ns_flags.into_iter().map(String::from));
        }

        if !self.config.dropped_capabilities.is_empty() {
            let drop_list = self
                .config
                .dropped_capabilities
                .iter()
                .map(|c| format!("-{c}"))
                .collect::<Vec<_>>()
                .join(",");
            prefix.push("capsh".to_string());
            prefix.push(format!("--drop={drop_list}"));
            prefix.push("--".to_string());
        }

        if config.filesystem_access == FilesystemAccess::Minimal {
            if let Err(e) = self.prepare_chroot(temp_dir) {
                warn!("failed to assemble chroot for {}: {e}", temp_dir.display());
            } else {
                prefix.push("chroot".to_string());
                prefix.push(temp_dir.display().to_string());
            }
        }

        prefix
    }

    fn prepare_chroot(&self, temp_dir: &std::path::Path) -> std::io::Result<()> {
        for dir in ["bin", "lib", "lib64", "usr/bin", "usr/lib", "tmp", "dev", "proc"] {
            std::fs::create_dir_all(temp_dir.join(dir))?;
        }
        for bin in ["/bin/sh"] {
            let src = std::path::Path::new(bin);
            if src.exists() {
                let dest = temp_dir.join(bin.trim_start_matches('/'));
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(src, dest)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn create_instance(
        &self,
        function_name: &str,
        function_config: &FunctionConfig,
        mut runtime_config: RuntimeConfig,
    ) -> ExecutorResult<String> {
        let runtime_id = uuid::Uuid::new_v4().to_string();
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("faas_{runtime_id}_"))
            .tempdir()
            .map_err(ExecutorError::Io)?;

        let port = self.ports.allocate()?;
        runtime_config.insert("RUNTIME_PORT".into(), port.to_string());
        runtime_config.insert("RUNTIME_ID".into(), runtime_id.clone());

        let cgroup_path = self.create_cgroup(
            &runtime_id,
            &function_config.memory_limit,
            &function_config.cpu_limit,
        );

        let prefix = self.isolation_prefix(function_config, temp_dir.path());
        let (program, args): (String, Vec<String>) = if prefix.is_empty() {
            (self.config.runtime_host_path.clone(), Vec::new())
        } else {
            let mut rest = prefix[1..].to_vec();
            rest.push(self.config.runtime_host_path.clone());
            (prefix[0].clone(), rest)
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(runtime_config.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            self.ports.release(port);
            ExecutorError::StartFailed(format!("failed to spawn runtime host: {e}"))
        })?;

        // Give the process a moment to fail fast on bad configuration.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(Some(status)) = child.try_wait() {
            self.ports.release(port);
            if let Some(path) = &cgroup_path {
                Self::cleanup_cgroup(path);
            }
            return Err(ExecutorError::StartFailed(format!(
                "runtime host exited immediately with {status}"
            )));
        }

        if let (Some(path), Some(pid)) = (&cgroup_path, child.id()) {
            Self::add_to_cgroup(path, pid);
        }

        info!(runtime_id = %runtime_id, function = function_name, port, "process instance started");

        let instance = Arc::new(Instance::new(
            runtime_id.clone(),
            function_name.to_string(),
            crate::registry::ExecutionMode::Process,
            port,
        ));

        self.instances.insert(
            runtime_id.clone(),
            ProcessHandle {
                instance,
                child: Mutex::new(child),
                temp_dir,
                cgroup_path,
            },
        );

        Ok(runtime_id)
    }

    async fn stop_instance(&self, runtime_id: &str) -> ExecutorResult<bool> {
        let Some((_, handle)) = self.instances.remove(runtime_id) else {
            return Ok(false);
        };

        self.ports.release(handle.instance.port);

        let mut child = handle.child.into_inner();
        if let Err(e) = child.start_kill() {
            debug!("child for {runtime_id} already gone: {e}");
        }
        if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
            warn!("timed out waiting for process {runtime_id} to exit: {e}");
        }

        if let Some(path) = &handle.cgroup_path {
            Self::cleanup_cgroup(path);
        }

        info!(runtime_id, "process instance stopped");
        Ok(true)
    }

    async fn cleanup_expired(&self, ttl_seconds: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .instances
            .iter()
            .filter(|e| e.instance.idle_seconds() as u64 > ttl_seconds)
            .map(|e| e.key().clone())
            .collect();

        let mut stopped = Vec::new();
        for runtime_id in expired {
            match self.stop_instance(&runtime_id).await {
                Ok(true) => stopped.push(runtime_id),
                Ok(false) => {}
                Err(e) => error!("failed to reap expired instance {runtime_id}: {e}"),
            }
        }
        stopped
    }

    fn update_last_used(&self, runtime_id: &str) {
        if let Some(handle) = self.instances.get(runtime_id) {
            handle.instance.touch();
        }
    }

    fn contains(&self, runtime_id: &str) -> bool {
        self.instances.contains_key(runtime_id)
    }

    fn instance_port(&self, runtime_id: &str) -> Option<u16> {
        self.instances.get(runtime_id).map(|h| h.instance.port)
    }

    async fn get_stats(&self) -> ExecutorStats {
        let mut running = 0usize;
        for mut entry in self.instances.iter_mut() {
            if matches!(entry.child.get_mut().try_wait(), Ok(None)) {
                running += 1;
            }
        }

        let mut features = vec!["fast_cold_start".to_string(), "high_density".to_string()];
        if cfg!(target_os = "linux") {
            features.push("namespace_isolation".into());
            if self.config.cgroup_root.exists() {
                features.push("cgroup_limits".into());
            }
        } else {
            features.push("basic_isolation".into());
        }

        ExecutorStats {
            executor_type: "process".into(),
            platform: std::env::consts::OS.to_string(),
            total_instances: self.instances.len(),
            running_instances: running,
            memory_usage_bytes: 0,
            avg_cold_start_ms: if cfg!(target_os = "linux") { 25 } else { 50 },
            supported_features: features,
        }
    }

    async fn health_check(&self) -> bool {
        if cfg!(target_os = "linux") {
            tokio::process::Command::new("unshare")
                .arg("--help")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false)
        } else {
            true
        }
    }

    async fn shutdown(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for runtime_id in ids {
            let _ = self.stop_instance(&runtime_id).await;
        }
    }
}
