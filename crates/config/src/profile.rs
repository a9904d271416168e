//! Sandbox profiles: the static runtime topology a sandbox is created from.

use std::collections::HashMap;

use bay_common::Capability;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Which adapter speaks to a container of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Code/shell/filesystem runtime.
    Code,
    /// Browser automation runtime.
    Browser,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResourceSpec {
    pub memory_mb: Option<u64>,
    /// Fraction of cores, e.g. 0.5 or 2.0.
    pub cpus: Option<f64>,
    pub pids_max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub runtime_type: RuntimeType,
    pub runtime_port: u16,
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Capabilities this container serves.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Capabilities this container is the preferred provider for when
    /// several containers declare the same one.
    #[serde(default)]
    pub primary_for: Vec<Capability>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum StartupOrder {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub order: StartupOrder,
    pub wait_for_all: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            order: StartupOrder::Parallel,
            wait_for_all: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    /// Seconds without activity before the session is reclaimed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub startup: StartupConfig,
    /// Environment shared by every container in the profile.
    #[serde(default)]
    pub env: HashMap<String, String>,

    // Legacy single-container shape; folded into `containers` by
    // `normalize` and never read afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_type: Option<RuntimeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
}

fn default_idle_timeout() -> u64 {
    600
}

impl Profile {
    /// Fold the legacy top-level image shape into a one-element container
    /// list and check structural invariants. Runs once at load time.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.containers.is_empty() {
            let image = self.image.take().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "profile {:?} declares neither containers nor an image",
                    self.id
                ))
            })?;
            let runtime_type = self.runtime_type.take().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "profile {:?} uses the single-image shape but lacks runtime_type",
                    self.id
                ))
            })?;
            let runtime_port = self.runtime_port.take().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "profile {:?} uses the single-image shape but lacks runtime_port",
                    self.id
                ))
            })?;
            self.containers.push(ContainerSpec {
                name: "main".into(),
                image,
                runtime_type,
                runtime_port,
                resources: ResourceSpec::default(),
                capabilities: std::mem::take(&mut self.capabilities),
                primary_for: Vec::new(),
                env: HashMap::new(),
            });
        } else if self.image.is_some() {
            return Err(ConfigError::Invalid(format!(
                "profile {:?} mixes the single-image shape with a containers list",
                self.id
            )));
        }

        let mut names = std::collections::HashSet::new();
        for container in &self.containers {
            if !names.insert(container.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "profile {:?} has duplicate container name {:?}",
                    self.id, container.name
                )));
            }
            if container.capabilities.is_empty() {
                tracing::warn!(
                    profile = %self.id,
                    container = %container.name,
                    "container declares no capabilities; it can never be routed to"
                );
            }
        }
        Ok(())
    }

    /// Union of capabilities across the profile's containers. The gateway
    /// gates requests on this before any compute is provisioned.
    pub fn capability_set(&self) -> Vec<Capability> {
        let mut set = Vec::new();
        for container in &self.containers {
            for cap in &container.capabilities {
                if !set.contains(cap) {
                    set.push(*cap);
                }
            }
        }
        set
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.containers
            .iter()
            .any(|c| c.capabilities.contains(&capability))
    }
}

pub(crate) fn default_profiles() -> Vec<Profile> {
    vec![
        Profile {
            id: "python-default".into(),
            description: "Python code runtime with shell and filesystem access".into(),
            containers: vec![ContainerSpec {
                name: "main".into(),
                image: "shipyard/python-runtime:latest".into(),
                runtime_type: RuntimeType::Code,
                runtime_port: 8000,
                resources: ResourceSpec {
                    memory_mb: Some(1024),
                    cpus: Some(1.0),
                    pids_max: None,
                },
                capabilities: vec![Capability::Code, Capability::Shell, Capability::Filesystem],
                primary_for: Vec::new(),
                env: HashMap::new(),
            }],
            idle_timeout: 600,
            startup: StartupConfig::default(),
            env: HashMap::new(),
            image: None,
            runtime_type: None,
            runtime_port: None,
            capabilities: Vec::new(),
        },
        Profile {
            id: "python-browser".into(),
            description: "Python runtime plus a browser runtime sharing the workspace".into(),
            containers: vec![
                ContainerSpec {
                    name: "main".into(),
                    image: "shipyard/python-runtime:latest".into(),
                    runtime_type: RuntimeType::Code,
                    runtime_port: 8000,
                    resources: ResourceSpec {
                        memory_mb: Some(1024),
                        cpus: Some(1.0),
                        pids_max: None,
                    },
                    capabilities: vec![
                        Capability::Code,
                        Capability::Shell,
                        Capability::Filesystem,
                    ],
                    primary_for: Vec::new(),
                    env: HashMap::new(),
                },
                ContainerSpec {
                    name: "browser".into(),
                    image: "shipyard/browser-runtime:latest".into(),
                    runtime_type: RuntimeType::Browser,
                    runtime_port: 8001,
                    resources: ResourceSpec {
                        memory_mb: Some(2048),
                        cpus: Some(2.0),
                        pids_max: None,
                    },
                    capabilities: vec![Capability::Browser],
                    primary_for: vec![Capability::Browser],
                    env: HashMap::new(),
                },
            ],
            idle_timeout: 600,
            startup: StartupConfig::default(),
            env: HashMap::new(),
            image: None,
            runtime_type: None,
            runtime_port: None,
            capabilities: Vec::new(),
        },
    ]
}
