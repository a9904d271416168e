//! Container/volume substrate abstraction.
//!
//! A narrow trait with two conforming implementations: the local Docker
//! engine (bollard) and a Kubernetes cluster (kube). Everything above this
//! crate speaks in terms of opaque container ids, endpoints, and labels; no
//! bollard or kube type crosses the boundary.

mod docker;
mod kubernetes;
mod labels;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bay_config::{BayConfig, ContainerSpec, DriverKind};

pub use {
    docker::DockerDriver,
    kubernetes::KubeDriver,
    labels::{LabelSchema, LabelVerdict},
};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Identity a container is created under; becomes its label set.
#[derive(Debug, Clone)]
pub struct CreateContext {
    pub owner: String,
    pub sandbox_id: String,
    pub session_id: String,
    pub cargo_id: String,
    pub profile_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

/// Point-in-time container status, used for crash detection.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub endpoint: Option<String>,
    pub exit_code: Option<i64>,
}

/// A container as seen by GC's broad label listing.
#[derive(Debug, Clone)]
pub struct RuntimeInstance {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub state: String,
}

/// Container/volume primitives on one substrate.
///
/// `create` provisions but must not make the container reachable; `start`
/// brings it up and returns a reachable base URL. `stop`/`destroy` are
/// idempotent: a missing container is success.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Cheap liveness probe against the substrate, run at startup.
    async fn ping(&self) -> DriverResult<()>;

    async fn create(
        &self,
        ctx: &CreateContext,
        spec: &ContainerSpec,
        cargo_ref: &str,
        labels: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> DriverResult<String>;

    async fn start(&self, container_id: &str, runtime_port: u16) -> DriverResult<String>;

    async fn stop(&self, container_id: &str) -> DriverResult<()>;

    async fn destroy(&self, container_id: &str) -> DriverResult<()>;

    async fn status(&self, container_id: &str, runtime_port: u16)
    -> DriverResult<ContainerStatus>;

    async fn logs(&self, container_id: &str, tail: usize) -> DriverResult<String>;

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
        size_limit_mb: Option<u64>,
    ) -> DriverResult<String>;

    /// Fails loudly when the volume is still attached to live containers.
    async fn delete_volume(&self, name: &str) -> DriverResult<()>;

    async fn volume_exists(&self, name: &str) -> DriverResult<bool>;

    /// GC only: enumerate containers matching every label in the filter.
    async fn list_runtime_instances(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> DriverResult<Vec<RuntimeInstance>>;

    /// GC only: force-destroy after orphan verification.
    async fn destroy_runtime_instance(&self, id: &str) -> DriverResult<()>;
}

/// Construct the configured driver. The substrate is probed on first use
/// (`ping`) by the caller, not here.
pub async fn create_driver(config: &BayConfig) -> DriverResult<Arc<dyn Driver>> {
    match config.driver.kind {
        DriverKind::Local => {
            let driver = DockerDriver::connect(&config.driver, &config.cargo)?;
            Ok(Arc::new(driver))
        }
        DriverKind::Cluster => {
            let driver = KubeDriver::connect(&config.driver, &config.cargo).await?;
            Ok(Arc::new(driver))
        }
    }
}
