//! In-memory driver for tests.
//!
//! Containers and volumes live in maps; `start` hands every container the
//! same configurable endpoint, which tests point at an in-process fake
//! runtime server. Foreign containers can be injected to exercise the
//! orphan-GC trust checks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bay_config::ContainerSpec;
use dashmap::DashMap;

use crate::{
    ContainerState, ContainerStatus, CreateContext, Driver, DriverError, DriverResult,
    RuntimeInstance,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
}

pub struct MemoryDriver {
    endpoint: String,
    next_id: AtomicU64,
    containers: DashMap<String, FakeContainer>,
    volumes: DashMap<String, HashMap<String, String>>,
    injected: Mutex<Vec<RuntimeInstance>>,
    fail_start: AtomicBool,
}

impl MemoryDriver {
    /// `endpoint` is what `start` returns for every container.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
            containers: DashMap::new(),
            volumes: DashMap::new(),
            injected: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Make subsequent `start` calls fail, for rollback tests.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Register a container the platform did not create.
    pub fn inject_instance(&self, instance: RuntimeInstance) {
        self.injected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(instance);
    }

    pub fn instance_present(&self, id: &str) -> bool {
        self.containers.contains_key(id)
            || self
                .injected
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .any(|instance| instance.id == id)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn containers_with_label(&self, key: &str, value: &str) -> Vec<FakeContainer> {
        self.containers
            .iter()
            .filter(|entry| entry.labels.get(key).map(String::as_str) == Some(value))
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    fn state_name(state: ContainerState) -> String {
        match state {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        }
        .to_string()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        _ctx: &CreateContext,
        spec: &ContainerSpec,
        _cargo_ref: &str,
        labels: &HashMap<String, String>,
        _env: &HashMap<String, String>,
    ) -> DriverResult<String> {
        let id = format!("fc_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                labels: labels.clone(),
                state: ContainerState::Created,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str, _runtime_port: u16) -> DriverResult<String> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DriverError::Other(anyhow::anyhow!(
                "start forced to fail for test"
            )));
        }
        let mut container = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        container.state = ContainerState::Running;
        Ok(self.endpoint.clone())
    }

    async fn stop(&self, container_id: &str) -> DriverResult<()> {
        if let Some(mut container) = self.containers.get_mut(container_id) {
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn destroy(&self, container_id: &str) -> DriverResult<()> {
        self.containers.remove(container_id);
        Ok(())
    }

    async fn status(
        &self,
        container_id: &str,
        _runtime_port: u16,
    ) -> DriverResult<ContainerStatus> {
        let container = self
            .containers
            .get(container_id)
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        Ok(ContainerStatus {
            state: container.state,
            endpoint: (container.state == ContainerState::Running)
                .then(|| self.endpoint.clone()),
            exit_code: None,
        })
    }

    async fn logs(&self, _container_id: &str, _tail: usize) -> DriverResult<String> {
        Ok(String::new())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
        _size_limit_mb: Option<u64>,
    ) -> DriverResult<String> {
        self.volumes.insert(name.to_string(), labels.clone());
        Ok(name.to_string())
    }

    async fn delete_volume(&self, name: &str) -> DriverResult<()> {
        self.volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn volume_exists(&self, name: &str) -> DriverResult<bool> {
        Ok(self.volumes.contains_key(name))
    }

    async fn list_runtime_instances(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> DriverResult<Vec<RuntimeInstance>> {
        let matches = |labels: &HashMap<String, String>| {
            label_filter
                .iter()
                .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
        };
        let mut instances: Vec<RuntimeInstance> = self
            .containers
            .iter()
            .filter(|entry| matches(&entry.labels))
            .map(|entry| RuntimeInstance {
                id: entry.id.clone(),
                name: entry.name.clone(),
                labels: entry.labels.clone(),
                state: Self::state_name(entry.state),
            })
            .collect();
        instances.extend(
            self.injected
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .filter(|instance| matches(&instance.labels))
                .cloned(),
        );
        Ok(instances)
    }

    async fn destroy_runtime_instance(&self, id: &str) -> DriverResult<()> {
        self.containers.remove(id);
        self.injected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|instance| instance.id != id);
        Ok(())
    }
}
