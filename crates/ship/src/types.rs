//! Wire types shared with runtime containers.

use std::collections::HashMap;

use bay_common::Capability;
use serde::{Deserialize, Serialize};

/// `GET /health` response. Runtimes may advertise extra readiness fields;
/// `browser_ready` gates readiness for runtimes with heavyweight warm-up.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub browser_ready: Option<bool>,
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        self.status == "ok" && self.browser_ready.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeInfoWire {
    name: String,
    version: String,
    api_version: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WorkspaceWire {
    mount_path: String,
}

/// Raw `/meta` payload; `capabilities` is an open string map on the wire.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RuntimeMetaWire {
    runtime: RuntimeInfoWire,
    workspace: WorkspaceWire,
    #[serde(default)]
    capabilities: HashMap<String, serde_json::Value>,
}

/// Parsed runtime metadata. Capabilities are the closed internal set;
/// kinds this control plane does not route are dropped at parse.
#[derive(Debug, Clone)]
pub struct RuntimeMeta {
    pub name: String,
    pub version: String,
    pub api_version: String,
    pub mount_path: String,
    pub capabilities: Vec<Capability>,
}

impl From<RuntimeMetaWire> for RuntimeMeta {
    fn from(wire: RuntimeMetaWire) -> Self {
        let capabilities = wire
            .capabilities
            .keys()
            .filter_map(|name| Capability::parse(name))
            .collect();
        RuntimeMeta {
            name: wire.runtime.name,
            version: wire.runtime.version,
            api_version: wire.runtime.api_version,
            mount_path: wire.workspace.mount_path,
            capabilities,
        }
    }
}

impl RuntimeMeta {
    pub(crate) fn parse(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let wire: RuntimeMetaWire = serde_json::from_value(value)?;
        Ok(wire.into())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeExecRequest {
    pub code: String,
    pub timeout: u64,
}

/// Runtime-level execution outcome. A `success = false` here is user code
/// failing, not a platform error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellExecRequest {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserExecRequest {
    pub cmd: serde_json::Value,
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserBatchRequest {
    pub commands: Vec<serde_json::Value>,
    pub timeout: u64,
    pub stop_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    #[serde(default)]
    pub size: Option<u64>,
}
