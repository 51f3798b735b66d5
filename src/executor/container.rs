//! Container executor: sandboxes realized as short-lived Docker containers
//! via the Docker Engine API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use dashmap::DashMap;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::DockerConfiguration;
use crate::registry::FunctionConfig;

use super::{Executor, ExecutorError, ExecutorResult, ExecutorStats, Instance, PortAllocator, RuntimeConfig};

const CONTAINER_PREFIX: &str = "faas-";

struct ContainerHandle {
    instance: Arc<Instance>,
    container_id: String,
}

pub struct ContainerExecutor {
    docker: Docker,
    config: DockerConfiguration,
    instances: DashMap<String, ContainerHandle>,
    host_ports: PortAllocator,
}

impl ContainerExecutor {
    pub fn new(config: DockerConfiguration) -> ExecutorResult<Self> {
        let docker = Docker::connect_with_socket(&config.socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;
        let host_ports = PortAllocator::new(config.host_port_range_start, config.host_port_range_end);
        Ok(Self {
            docker,
            config,
            instances: DashMap::new(),
            host_ports,
        })
    }

    async fn ensure_image(&self, image: &str) -> ExecutorResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                info!("image {image} not present, pulling");
            }
            Err(e) => warn!("error inspecting image {image}: {e}"),
        }

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull {image}: {status}");
                    }
                }
                Err(e) => {
                    error!("failed to pull image {image}: {e}");
                    return Err(ExecutorError::StartFailed(format!("image pull failed: {e}")));
                }
            }
        }
        Ok(())
    }

    async fn wait_for_running(&self, container_id: &str) -> ExecutorResult<()> {
        for _ in 0..30 {
            let inspect = self
                .docker
                .inspect_container(container_id, None)
                .await
                .map_err(|e| ExecutorError::StartFailed(e.to_string()))?;
            if let Some(state) = inspect.state {
                if state.running.unwrap_or(false) {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    return Ok(());
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Err(ExecutorError::StartFailed("container did not reach running state".into()))
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn create_instance(
        &self,
        function_name: &str,
        function_config: &FunctionConfig,
        mut runtime_config: RuntimeConfig,
    ) -> ExecutorResult<String> {
        let runtime_id = uuid::Uuid::new_v4().to_string();
        let container_name = format!("{CONTAINER_PREFIX}{runtime_id}");
        let image = self.config.base_image.clone();

        self.ensure_image(&image).await?;

        let port: u16 = 8080;
        runtime_config.insert("RUNTIME_PORT".into(), port.to_string());
        runtime_config.insert("RUNTIME_ID".into(), runtime_id.clone());

        let env_vars: Vec<String> = runtime_config
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_port = self.host_ports.allocate()?;
        let port_guard = scopeguard::guard(host_port, |p| self.host_ports.release(p));

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            format!("{port}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".into()),
                host_port: Some(host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{port}/tcp"), HashMap::new());

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}M", self.config.tmpfs_size_mb),
        );

        let function_path = std::env::temp_dir().join(format!("{runtime_id}_function.py"));
        if let Some(code) = runtime_config.get("FUNCTION_SOURCE") {
            let _ = std::fs::write(&function_path, code);
        }

        let mounts = vec![bollard::models::Mount {
            target: Some("/tmp/user_function.py".into()),
            source: Some(function_path.display().to_string()),
            typ: Some(bollard::models::MountTypeEnum::BIND),
            read_only: Some(true),
            ..Default::default()
        }];

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            tmpfs: Some(tmpfs),
            memory: super::parse_memory_limit(&function_config.memory_limit).map(|v| v as i64),
            cpu_quota: super::parse_cpu_quota(&function_config.cpu_limit).map(|v| v as i64),
            cpu_period: Some(100_000),
            pids_limit: Some(self.config.pid_limit),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["NET_BIND_SERVICE".to_string()]),
            network_mode: Some(if function_config.network_access {
                self.config.network.clone()
            } else {
                "none".to_string()
            }),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                ..Default::default()
            }),
            readonly_rootfs: Some(true),
            ..Default::default()
        };

        let container_config = Config {
            env: Some(env_vars),
            image: Some(image),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| ExecutorError::StartFailed(e.to_string()))?;

        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            let _ = self
                .docker
                .remove_container(&created.id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
            return Err(ExecutorError::StartFailed(e.to_string()));
        }

        if let Err(e) = self.wait_for_running(&created.id).await {
            let _ = self
                .docker
                .remove_container(&created.id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
            return Err(e);
        }

        info!(runtime_id = %runtime_id, function = function_name, container = %created.id, "container instance started");

        let instance = Arc::new(Instance::new(
            runtime_id.clone(),
            function_name.to_string(),
            crate::registry::ExecutionMode::Container,
            host_port,
        ));

        self.instances.insert(
            runtime_id.clone(),
            ContainerHandle {
                instance,
                container_id: created.id,
            },
        );
        scopeguard::ScopeGuard::into_inner(port_guard);

        Ok(runtime_id)
    }

    async fn stop_instance(&self, runtime_id: &str) -> ExecutorResult<bool> {
        let Some((_, handle)) = self.instances.remove(runtime_id) else {
            return Ok(false);
        };

        self.host_ports.release(handle.instance.port);

        if let Err(e) = self
            .docker
            .stop_container(&handle.container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            debug!("container {} already stopped: {e}", handle.container_id);
        }

        if let Err(e) = self
            .docker
            .remove_container(
                &handle.container_id,
                Some(RemoveContainerOptions { force: true, v: false, ..Default::default() }),
            )
            .await
        {
            warn!("failed to remove container {}: {e}", handle.container_id);
        }

        info!(runtime_id, container = %handle.container_id, "container instance stopped");
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
                Err(e) => error!("failed to reap expired container {runtime_id}: {e}"),
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
        for entry in self.instances.iter() {
            if let Ok(inspect) = self.docker.inspect_container(&entry.container_id, None).await {
                if inspect.state.and_then(|s| s.running).unwrap_or(false) {
                    running += 1;
                }
            }
        }

        ExecutorStats {
            executor_type: "container".into(),
            platform: "docker".into(),
            total_instances: self.instances.len(),
            running_instances: running,
            memory_usage_bytes: 0,
            avg_cold_start_ms: 400,
            supported_features: vec![
                "image_isolation".into(),
                "readonly_rootfs".into(),
                "capability_drop".into(),
            ],
        }
    }

    async fn health_check(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn shutdown(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for runtime_id in ids {
            let _ = self.stop_instance(&runtime_id).await;
        }

        // Sweep any faas-prefixed containers this process lost track of.
        let options = Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        });
        if let Ok(containers) = self.docker.list_containers(options).await {
            for c in containers {
                let name_matches = c
                    .names
                    .unwrap_or_default()
                    .iter()
                    .any(|n| n.trim_start_matches('/').starts_with(CONTAINER_PREFIX));
                if name_matches {
                    if let Some(id) = c.id {
                        let _ = self
                            .docker
                            .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                            .await;
                    }
                }
            }
        }
    }
}
