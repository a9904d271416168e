//! Persistent records and the status computation.
//!
//! Sandbox status is never stored: it is a pure function of a few columns
//! and wall-clock time, so reads can never observe a stale status.

use bay_common::Capability;
use bay_config::RuntimeType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Starting,
    Ready,
    Failed,
    Idle,
    Expired,
    Deleted,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Starting => "starting",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Idle => "idle",
            SandboxStatus::Expired => "expired",
            SandboxStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(SessionStatus::Starting),
            "ready" => Some(SessionStatus::Ready),
            "failed" => Some(SessionStatus::Failed),
            "stopped" => Some(SessionStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SandboxRecord {
    pub id: String,
    pub owner: String,
    pub profile_id: String,
    pub cargo_id: String,
    pub current_session_id: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub idle_expires_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl SandboxRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at < now_ms)
    }

    /// Status precedence: deleted, expired, idle, then the live session's
    /// aggregated status.
    pub fn status(&self, session_status: Option<SessionStatus>, now_ms: i64) -> SandboxStatus {
        if self.is_deleted() {
            return SandboxStatus::Deleted;
        }
        if self.is_expired(now_ms) {
            return SandboxStatus::Expired;
        }
        if self.current_session_id.is_none() {
            return SandboxStatus::Idle;
        }
        match session_status {
            Some(SessionStatus::Ready) => SandboxStatus::Ready,
            Some(SessionStatus::Starting) => SandboxStatus::Starting,
            Some(SessionStatus::Failed) => SandboxStatus::Failed,
            // A dangling pointer or stopped session reads as idle; the next
            // capability call reprovisions.
            Some(SessionStatus::Stopped) | None => SandboxStatus::Idle,
        }
    }
}

/// One running container inside a session, as persisted in the session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub container_id: String,
    pub endpoint: String,
    pub runtime_type: RuntimeType,
    pub runtime_port: u16,
    pub capabilities: Vec<Capability>,
    pub primary_for: Vec<Capability>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub sandbox_id: String,
    pub profile_id: String,
    pub status: SessionStatus,
    pub containers: Vec<ContainerInfo>,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CargoRecord {
    pub id: String,
    pub owner: String,
    pub managed: bool,
    pub managed_by_sandbox_id: Option<String>,
    pub backend: String,
    pub driver_ref: String,
    pub size_limit_mb: Option<i64>,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub sandbox_id: String,
    pub session_id: String,
    pub exec_type: String,
    pub started_at: i64,
    pub duration_ms: i64,
    pub success: bool,
    pub metadata: Option<serde_json::Value>,
}
