//! Diagnostics command - reports process- and container-executor readiness.

use anyhow::Result;
use bollard::Docker;
use sysinfo::System;

use faasd::config::Configuration;

/// Run diagnostics and display sandbox readiness.
pub async fn run(config_path: &str) -> Result<()> {
    println!("faasd Diagnostics");
    println!("=================\n");

    let config = Configuration::load(config_path).unwrap_or_default_or_log();

    println!("System Information:");
    println!("-------------------");
    let mut sys = System::new_all();
    sys.refresh_all();
    println!("  OS: {} {}", System::name().unwrap_or_default(), System::os_version().unwrap_or_default());
    println!("  Kernel: {}", System::kernel_version().unwrap_or_default());
    println!("  CPUs: {}", sys.cpus().len());
    println!("  Total Memory: {} MB", sys.total_memory() / 1024 / 1024);

    println!("\nProcess Executor:");
    println!("-----------------");
    if cfg!(target_os = "linux") {
        match tokio::process::Command::new("unshare").arg("--help").output().await {
            Ok(out) if out.status.success() => println!("  unshare: available"),
            Ok(_) => println!("  unshare: present but exited non-zero"),
            Err(e) => println!("  unshare: not found ({e}) - install util-linux for namespace isolation"),
        }

        let cgroup_root = config
            .as_ref()
            .map(|c| c.process.cgroup_root.clone())
            .unwrap_or_else(|| "/sys/fs/cgroup/faas".into());
        let cgroup_mount = std::path::Path::new("/sys/fs/cgroup/cgroup.controllers");
        if cgroup_mount.exists() {
            println!("  cgroup v2: mounted");
        } else {
            println!("  cgroup v2: not detected at /sys/fs/cgroup - resource limits will be disabled");
        }
        println!("  cgroup root: {}", cgroup_root.display());
    } else {
        println!("  namespace isolation: unavailable on {} (process mode falls back to plain child processes)", std::env::consts::OS);
    }

    println!("\nContainer Executor:");
    println!("-------------------");
    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => println!("  Docker socket: reachable"),
            Err(e) => println!("  Docker socket: connected but ping failed ({e})"),
        },
        Err(e) => println!("  Docker socket: unreachable ({e}) - container-mode functions will fail to provision"),
    }

    println!("\nDiagnostics complete.");
    Ok(())
}

trait ConfigOrLog {
    fn unwrap_or_default_or_log(self) -> Option<Configuration>;
}

impl ConfigOrLog for Result<Configuration> {
    fn unwrap_or_default_or_log(self) -> Option<Configuration> {
        match self {
            Ok(c) => Some(c),
            Err(e) => {
                println!("  (failed to load configuration: {e}, using built-in defaults for this report)");
                None
            }
        }
    }
}
