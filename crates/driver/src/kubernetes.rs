//! Kubernetes cluster driver (kube + k8s-openapi).
//!
//! Pods have no created-but-not-started state, so `create` stages the pod
//! manifest in memory and `start` submits it, then polls until the pod is
//! `Running` with an IP. Cargo volumes are PVCs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bay_config::{CargoConfig, ContainerSpec, DriverConfig};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::{Client, Error as KubeError};
use tracing::{debug, info, warn};

use crate::{
    ContainerState, ContainerStatus, CreateContext, Driver, DriverError, DriverResult,
    RuntimeInstance,
};

const CARGO_VOLUME: &str = "cargo";

pub struct KubeDriver {
    client: Client,
    pods: Api<Pod>,
    pvcs: Api<PersistentVolumeClaim>,
    /// Manifests staged by `create`, consumed by `start`.
    staged: DashMap<String, Pod>,
    storage_class: Option<String>,
    mount_path: String,
    start_timeout: Duration,
}

impl KubeDriver {
    pub async fn connect(driver: &DriverConfig, cargo: &CargoConfig) -> DriverResult<Self> {
        let client = Client::try_default()
            .await
            .context("failed to build a Kubernetes client from the environment")?;
        let pods = Api::namespaced(client.clone(), &driver.namespace);
        let pvcs = Api::namespaced(client.clone(), &driver.namespace);
        Ok(Self {
            client,
            pods,
            pvcs,
            staged: DashMap::new(),
            storage_class: driver.storage_class.clone(),
            mount_path: cargo.mount_path.clone(),
            start_timeout: Duration::from_secs(driver.start_timeout_seconds),
        })
    }

    /// Pod names must be DNS-1123; ids carry underscores, so swap them out.
    fn pod_name(ctx: &CreateContext, spec: &ContainerSpec) -> String {
        format!("bay-{}-{}", ctx.session_id.replace('_', "-"), spec.name)
    }

    fn build_pod(
        &self,
        name: &str,
        spec: &ContainerSpec,
        cargo_ref: &str,
        labels: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> Pod {
        let mut limits = BTreeMap::new();
        if let Some(mb) = spec.resources.memory_mb {
            limits.insert("memory".to_string(), Quantity(format!("{mb}Mi")));
        }
        if let Some(cpus) = spec.resources.cpus {
            limits.insert("cpu".to_string(), Quantity(cpus.to_string()));
        }

        let env: Vec<EnvVar> = env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: spec.name.clone(),
                    image: Some(spec.image.clone()),
                    ports: Some(vec![ContainerPort {
                        container_port: i32::from(spec.runtime_port),
                        ..Default::default()
                    }]),
                    env: Some(env),
                    resources: (!limits.is_empty()).then(|| ResourceRequirements {
                        limits: Some(limits),
                        ..Default::default()
                    }),
                    volume_mounts: Some(vec![VolumeMount {
                        name: CARGO_VOLUME.to_string(),
                        mount_path: self.mount_path.clone(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: CARGO_VOLUME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: cargo_ref.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn map_kube(err: KubeError, what: &str) -> DriverError {
    match err {
        KubeError::Api(ae) if ae.code == 404 => DriverError::NotFound(what.to_string()),
        KubeError::Api(ae) if ae.code == 409 => DriverError::Conflict(ae.message),
        other => DriverError::Other(anyhow::Error::new(other).context(what.to_string())),
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn pod_exit_code(pod: &Pod) -> Option<i64> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|cs| cs.state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .map(|t| i64::from(t.exit_code))
}

#[async_trait]
impl Driver for KubeDriver {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn ping(&self) -> DriverResult<()> {
        self.client
            .apiserver_version()
            .await
            .map_err(|e| map_kube(e, "apiserver version"))?;
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
        let name = Self::pod_name(ctx, spec);
        let pod = self.build_pod(&name, spec, cargo_ref, labels, env);
        self.staged.insert(name.clone(), pod);
        debug!(pod = %name, "staged pod manifest");
        Ok(name)
    }

    async fn start(&self, container_id: &str, runtime_port: u16) -> DriverResult<String> {
        let (_, pod) = self
            .staged
            .remove(container_id)
            .ok_or_else(|| DriverError::NotFound(format!("no staged pod {container_id}")))?;

        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| map_kube(e, "create pod"))?;

        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!(
                    "pod {container_id} did not reach Running"
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;

            let current = self
                .pods
                .get(container_id)
                .await
                .map_err(|e| map_kube(e, "get pod"))?;
            match pod_phase(&current) {
                Some("Running") => {
                    if let Some(ip) = current.status.as_ref().and_then(|s| s.pod_ip.clone()) {
                        let endpoint = format!("http://{ip}:{runtime_port}");
                        info!(pod = container_id, endpoint = %endpoint, "pod running");
                        return Ok(endpoint);
                    }
                }
                Some("Failed") => {
                    return Err(DriverError::Other(anyhow::anyhow!(
                        "pod {container_id} entered Failed during startup"
                    )));
                }
                _ => {}
            }
        }
    }

    async fn stop(&self, container_id: &str) -> DriverResult<()> {
        self.staged.remove(container_id);
        match self
            .pods
            .delete(container_id, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match map_kube(e, "delete pod") {
                DriverError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn destroy(&self, container_id: &str) -> DriverResult<()> {
        self.staged.remove(container_id);
        match self
            .pods
            .delete(container_id, &DeleteParams::default().grace_period(0))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match map_kube(e, "force delete pod") {
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
        if self.staged.contains_key(container_id) {
            return Ok(ContainerStatus {
                state: ContainerState::Created,
                endpoint: None,
                exit_code: None,
            });
        }
        let pod = self
            .pods
            .get(container_id)
            .await
            .map_err(|e| map_kube(e, "get pod"))?;
        let (state, endpoint, exit_code) = match pod_phase(&pod) {
            Some("Running") => {
                let endpoint = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.pod_ip.clone())
                    .map(|ip| format!("http://{ip}:{runtime_port}"));
                (ContainerState::Running, endpoint, None)
            }
            Some("Pending") => (ContainerState::Created, None, None),
            Some("Succeeded") | Some("Failed") => {
                (ContainerState::Exited, None, pod_exit_code(&pod))
            }
            _ => (ContainerState::Unknown, None, None),
        };
        Ok(ContainerStatus {
            state,
            endpoint,
            exit_code,
        })
    }

    async fn logs(&self, container_id: &str, tail: usize) -> DriverResult<String> {
        self.pods
            .logs(
                container_id,
                &LogParams {
                    tail_lines: Some(tail as i64),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_kube(e, "pod logs"))
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
        size_limit_mb: Option<u64>,
    ) -> DriverResult<String> {
        let size = size_limit_mb.unwrap_or(1024);
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(format!("{size}Mi")),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: self.storage_class.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.pvcs
            .create(&PostParams::default(), &pvc)
            .await
            .map_err(|e| map_kube(e, "create pvc"))?;
        Ok(name.to_string())
    }

    async fn delete_volume(&self, name: &str) -> DriverResult<()> {
        // The API server owns the in-use invariant: deleting a mounted PVC
        // is held by its protection finalizer rather than silently leaking.
        match self.pvcs.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => Err(map_kube(e, "delete pvc")),
        }
    }

    async fn volume_exists(&self, name: &str) -> DriverResult<bool> {
        match self.pvcs.get(name).await {
            Ok(_) => Ok(true),
            Err(e) => match map_kube(e, "get pvc") {
                DriverError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list_runtime_instances(
        &self,
        label_filter: &HashMap<String, String>,
    ) -> DriverResult<Vec<RuntimeInstance>> {
        let selector: Vec<String> = label_filter
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let pods = self
            .pods
            .list(&ListParams::default().labels(&selector.join(",")))
            .await
            .map_err(|e| map_kube(e, "list pods"))?;

        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name.clone()?;
                let state = pod_phase(&pod).unwrap_or("Unknown").to_string();
                let labels = pod
                    .metadata
                    .labels
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                Some(RuntimeInstance {
                    id: name.clone(),
                    name,
                    labels,
                    state,
                })
            })
            .collect())
    }

    async fn destroy_runtime_instance(&self, id: &str) -> DriverResult<()> {
        warn!(pod = id, "destroying orphaned pod");
        self.destroy(id).await
    }
}
