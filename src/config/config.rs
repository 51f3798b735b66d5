//! Configuration structures and loading.

use std::path::PathBuf;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub api: ApiConfiguration,

    #[serde(default)]
    pub system: SystemConfiguration,

    #[serde(default)]
    pub process: ProcessConfiguration,

    #[serde(default)]
    pub docker: DockerConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file, defaulting every field a minimal
    /// or empty file omits.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let mut config: Configuration = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("failed to read config file: {path}"))?;
            toml::from_str(&content).with_context(|| "failed to parse configuration")?
        } else {
            toml::from_str("").with_context(|| "failed to build default configuration")?
        };

        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.system.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.system.function_directory)?;
        std::fs::create_dir_all(&config.system.tmp_directory)?;
        std::fs::create_dir_all(&config.system.log_directory)?;

        Ok(config)
    }
}

/// Management HTTP facade configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: SslConfiguration,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            ssl: SslConfiguration::default(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfiguration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

/// System-wide paths and scheduling knobs shared by every component.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Directory that function source blobs are stored under.
    #[serde(default = "default_function_directory")]
    pub function_directory: PathBuf,

    /// Scratch directory for per-instance temp dirs (process mode).
    #[serde(default = "default_tmp_directory")]
    pub tmp_directory: PathBuf,

    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    /// Default execution mode for functions that don't specify one.
    #[serde(default = "default_execution_mode")]
    pub default_execution_mode: String,

    /// Idle TTL, in seconds, before the reaper evicts a warm instance.
    #[serde(default = "default_warm_instance_ttl")]
    pub warm_instance_ttl_seconds: u64,

    /// Autoscaler tick interval, in seconds.
    #[serde(default = "default_autoscale_interval")]
    pub autoscale_interval_seconds: u64,

    /// Reaper tick interval, in seconds.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            function_directory: default_function_directory(),
            tmp_directory: default_tmp_directory(),
            log_directory: default_log_directory(),
            default_execution_mode: default_execution_mode(),
            warm_instance_ttl_seconds: default_warm_instance_ttl(),
            autoscale_interval_seconds: default_autoscale_interval(),
            reaper_interval_seconds: default_reaper_interval(),
        }
    }
}

impl SystemConfiguration {
    pub fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        self.function_directory = Self::resolve_path(&self.function_directory, base_dir);
        self.tmp_directory = Self::resolve_path(&self.tmp_directory, base_dir);
        self.log_directory = Self::resolve_path(&self.log_directory, base_dir);
    }

    fn resolve_path(path: &std::path::Path, base_dir: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            let resolved = base_dir.join(path);
            resolved
                .canonicalize()
                .unwrap_or_else(|_| Self::normalize_path(&resolved))
        }
    }

    fn normalize_path(path: &std::path::Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    components.pop();
                }
                std::path::Component::CurDir => {}
                c => components.push(c),
            }
        }
        components.iter().collect()
    }
}

fn default_function_directory() -> PathBuf {
    PathBuf::from(".faas/functions")
}

fn default_tmp_directory() -> PathBuf {
    PathBuf::from(".faas/tmp")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(".faas/logs")
}

fn default_execution_mode() -> String {
    "process".into()
}

fn default_warm_instance_ttl() -> u64 {
    600
}

fn default_autoscale_interval() -> u64 {
    10
}

fn default_reaper_interval() -> u64 {
    60
}

/// Process executor configuration: isolation knobs for native-OS sandboxes.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfiguration {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Namespace kinds unshared when `isolation_level = strict`.
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,

    /// Capabilities dropped when `isolation_level = strict`.
    #[serde(default = "default_dropped_capabilities")]
    pub dropped_capabilities: Vec<String>,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Path to the binary launched for every instance (the runtime host).
    #[serde(default = "default_runtime_host_path")]
    pub runtime_host_path: String,
}

impl Default for ProcessConfiguration {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            namespaces: default_namespaces(),
            dropped_capabilities: default_dropped_capabilities(),
            cgroup_root: default_cgroup_root(),
            runtime_host_path: default_runtime_host_path(),
        }
    }
}

fn default_port_range_start() -> u16 {
    9000
}

fn default_port_range_end() -> u16 {
    9999
}

fn default_namespaces() -> Vec<String> {
    vec!["pid".into(), "mount".into(), "ipc".into(), "uts".into()]
}

fn default_dropped_capabilities() -> Vec<String> {
    vec![
        "CAP_SYS_ADMIN".into(),
        "CAP_NET_ADMIN".into(),
        "CAP_SYS_MODULE".into(),
        "CAP_SYS_PTRACE".into(),
        "CAP_SYS_BOOT".into(),
        "CAP_SYS_TIME".into(),
        "CAP_SETUID".into(),
        "CAP_SETGID".into(),
    ]
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/faas")
}

fn default_runtime_host_path() -> String {
    "runtime-host".into()
}

/// Container executor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    #[serde(default = "default_base_image")]
    pub base_image: String,

    #[serde(default = "default_network_name")]
    pub network: String,

    #[serde(default = "default_tmpfs_size_mb")]
    pub tmpfs_size_mb: u64,

    #[serde(default = "default_pid_limit")]
    pub pid_limit: i64,

    /// Host-side loopback port range bound to each container's runtime port.
    #[serde(default = "default_host_port_start")]
    pub host_port_range_start: u16,

    #[serde(default = "default_host_port_end")]
    pub host_port_range_end: u16,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            base_image: default_base_image(),
            network: default_network_name(),
            tmpfs_size_mb: default_tmpfs_size_mb(),
            pid_limit: default_pid_limit(),
            host_port_range_start: default_host_port_start(),
            host_port_range_end: default_host_port_end(),
        }
    }
}

fn default_host_port_start() -> u16 {
    19000
}

fn default_host_port_end() -> u16 {
    19999
}

fn default_docker_socket() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let colima = std::path::Path::new(&home).join(".colima/default/docker.sock");
            if colima.exists() {
                return format!("unix://{}", colima.display());
            }
            let desktop = std::path::Path::new(&home).join(".docker/run/docker.sock");
            if desktop.exists() {
                return format!("unix://{}", desktop.display());
            }
        }
        "/var/run/docker.sock".into()
    }
}

fn default_base_image() -> String {
    "faas-base:latest".into()
}

fn default_network_name() -> String {
    "bridge".into()
}

fn default_tmpfs_size_mb() -> u64 {
    100
}

fn default_pid_limit() -> i64 {
    512
}
