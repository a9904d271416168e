//! Local Docker engine driver (bollard).

use std::collections::HashMap;

use anyhow::Context as _;
use async_trait::async_trait;
use bay_config::{CargoConfig, ContainerSpec, DriverConfig, NetworkMode};
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{HostConfig, PortBinding};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use futures::StreamExt as _;
use tracing::{debug, info};

use crate::{
    ContainerState, ContainerStatus, CreateContext, Driver, DriverError, DriverResult,
    RuntimeInstance,
};

pub struct DockerDriver {
    docker: Docker,
    network_mode: NetworkMode,
    host_address: String,
    mount_path: String,
    start_timeout: std::time::Duration,
}

impl DockerDriver {
    pub fn connect(driver: &DriverConfig, cargo: &CargoConfig) -> DriverResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to the Docker engine")?;
        Ok(Self {
            docker,
            network_mode: driver.network_mode,
            host_address: driver.host_address.clone(),
            mount_path: cargo.mount_path.clone(),
            start_timeout: std::time::Duration::from_secs(driver.start_timeout_seconds),
        })
    }

    fn container_name(ctx: &CreateContext, spec: &ContainerSpec) -> String {
        format!("bay-{}-{}", ctx.session_id, spec.name)
    }

    /// Resolve the reachable endpoint for a running container.
    fn resolve_endpoint(
        &self,
        inspect: &bollard::models::ContainerInspectResponse,
        runtime_port: u16,
    ) -> DriverResult<String> {
        let settings = inspect
            .network_settings
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("container has no network settings"))?;
        match self.network_mode {
            NetworkMode::HostPort => {
                let key = format!("{runtime_port}/tcp");
                let host_port = settings
                    .ports
                    .as_ref()
                    .and_then(|ports| ports.get(&key))
                    .and_then(|bindings| bindings.as_ref())
                    .and_then(|bindings| bindings.first())
                    .and_then(|binding| binding.host_port.clone())
                    .ok_or_else(|| {
                        anyhow::anyhow!("no host port published for {key}")
                    })?;
                Ok(format!("http://{}:{host_port}", self.host_address))
            }
            NetworkMode::ContainerIp => {
                let ip = settings
                    .networks
                    .as_ref()
                    .and_then(|networks| networks.values().next())
                    .and_then(|endpoint| endpoint.ip_address.clone())
                    .filter(|ip| !ip.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("container has no network IP"))?;
                Ok(format!("http://{ip}:{runtime_port}"))
            }
        }
    }
}

/// Treat engine 404s as the id being gone.
fn map_missing(err: BollardError, what: &str) -> DriverError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound(what.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => DriverError::Conflict(message),
        other => DriverError::Other(anyhow::Error::new(other).context(what.to_string())),
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> DriverResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| DriverError::Other(anyhow::Error::new(e).context("docker ping")))?;
        Ok(())
    }

    async fn create(
        &self,
        ctx: &CreateContext,
        spec: &ContainerSpec,
        cargo_ref: &str,
        labels: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> DriverResult<String> {
        let name = Self::container_name(ctx, spec);
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let port_key = format!("{}/tcp", spec.runtime_port);
        let port_bindings = match self.network_mode {
            NetworkMode::HostPort => Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some(self.host_address.clone()),
                    // Empty string asks the engine for an ephemeral port.
                    host_port: Some(String::new()),
                }]),
            )])),
            NetworkMode::ContainerIp => None,
        };

        let host_config = HostConfig {
            binds: Some(vec![format!("{cargo_ref}:{}", self.mount_path)]),
            memory: spec.resources.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
            nano_cpus: spec.resources.cpus.map(|c| (c * 1e9) as i64),
            pids_limit: spec.resources.pids_max.map(i64::from),
            port_bindings,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| map_missing(e, "create container"))?;
        debug!(container_id = %response.id, name = %name, "created container");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str, runtime_port: u16) -> DriverResult<String> {
        let start = async {
            self.docker
                .start_container(container_id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| map_missing(e, "start container"))?;
            let inspect = self
                .docker
                .inspect_container(container_id, None)
                .await
                .map_err(|e| map_missing(e, "inspect container"))?;
            self.resolve_endpoint(&inspect, runtime_port)
        };
        let endpoint = tokio::time::timeout(self.start_timeout, start)
            .await
            .map_err(|_| DriverError::Timeout(format!("starting container {container_id}")))??;
        info!(container_id, endpoint = %endpoint, "container started");
        Ok(endpoint)
    }

    async fn stop(&self, container_id: &str) -> DriverResult<()> {
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match map_missing(e, "stop container") {
                DriverError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn destroy(&self, container_id: &str) -> DriverResult<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match map_missing(e, "remove container") {
                DriverError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn status(
        &self,
        container_id: &str,
        runtime_port: u16,
    ) -> DriverResult<ContainerStatus> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| map_missing(e, "inspect container"))?;
        let (state, exit_code) = match inspect.state.as_ref() {
            Some(state) if state.running == Some(true) => (ContainerState::Running, None),
            Some(state) if state.status
                == Some(bollard::models::ContainerStateStatusEnum::CREATED) =>
            {
                (ContainerState::Created, None)
            }
            Some(state) => (ContainerState::Exited, state.exit_code),
            None => (ContainerState::Unknown, None),
        };
        let endpoint = if state == ContainerState::Running {
            self.resolve_endpoint(&inspect, runtime_port).ok()
        } else {
            None
        };
        Ok(ContainerStatus {
            state,
            endpoint,
            exit_code,
        })
    }

    async fn logs(&self, container_id: &str, tail: usize) -> DriverResult<String> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_missing(e, "container logs"))?;
            out.push_str(&chunk.to_string());
        }
        Ok(out)
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
        _size_limit_mb: Option<u64>,
    ) -> DriverResult<String> {
        // The default local volume driver has no size enforcement; the limit
        // is recorded on the cargo row and enforced by the runtime.
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| map_missing(e, "create volume"))?;
        Ok(name.to_string())
    }

    async fn delete_volume(&self, name: &str) -> DriverResult<()> {
        // No force: a volume still attached to containers fails with 409,
        // which callers must surface rather than leak.
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| map_missing(e, "remove volume"))
    }

    async fn volume_exists(&self, name: &str) -> DriverResult<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) => match map_missing(e, "inspect volume") {
                DriverError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list_runtime_instances(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> DriverResult<Vec<RuntimeInstance>> {
        let label_terms: Vec<String> = label_filter
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([("label".to_string(), label_terms)]),
                ..Default::default()
            }))
            .await
            .map_err(|e| map_missing(e, "list containers"))?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(RuntimeInstance {
                    id,
                    name,
                    labels: summary.labels.unwrap_or_default(),
                    state: summary.state.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn destroy_runtime_instance(&self, id: &str) -> DriverResult<()> {
        self.destroy(id).await
    }
}
