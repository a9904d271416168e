//! Capability routing: from `(sandbox, capability)` to an adapter call on
//! the right container, with execution recording and dead-runtime recovery.

use std::sync::Arc;

use bay_common::{BayError, Capability, ErrorCode, Result, execution_id, now_ms};
use bay_ship::{ShipCache, ShipClient};
use tracing::{debug, warn};

use crate::locks::SandboxLocks;
use crate::model::{ContainerInfo, ExecutionRecord, SessionRecord};
use crate::sandbox_manager::SandboxManager;
use crate::session_manager::SessionManager;
use crate::store::Store;

/// Attached to every capability response.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub execution_id: String,
    pub execution_time_ms: i64,
    pub session_id: String,
}

/// Runtime-level success of a capability result, for the execution record.
/// Platform failures never reach this; they surface as errors instead.
pub trait Outcome {
    fn succeeded(&self) -> bool {
        true
    }
}

impl Outcome for bay_ship::ExecOutcome {
    fn succeeded(&self) -> bool {
        self.success
    }
}

impl Outcome for bay_ship::ShellOutcome {
    fn succeeded(&self) -> bool {
        self.success
    }
}

impl Outcome for serde_json::Value {}
impl Outcome for String {}
impl Outcome for bytes::Bytes {}
impl Outcome for () {}
impl Outcome for Vec<bay_ship::DirEntry> {}

pub struct CapabilityRouter {
    store: Arc<Store>,
    sandboxes: Arc<SandboxManager>,
    sessions: Arc<SessionManager>,
    ships: Arc<ShipCache>,
    locks: Arc<SandboxLocks>,
}

impl CapabilityRouter {
    pub fn new(
        store: Arc<Store>,
        sandboxes: Arc<SandboxManager>,
        sessions: Arc<SessionManager>,
        ships: Arc<ShipCache>,
        locks: Arc<SandboxLocks>,
    ) -> Self {
        Self {
            store,
            sandboxes,
            sessions,
            ships,
            locks,
        }
    }

    /// Route one capability call: ensure a session, pick the container,
    /// verify the runtime actually advertises the capability, run the
    /// operation, and record an execution row.
    pub async fn invoke<T, F, Fut>(
        &self,
        sandbox_id: &str,
        owner: &str,
        capability: Capability,
        exec_type: &str,
        metadata: Option<serde_json::Value>,
        operation: F,
    ) -> Result<(T, ExecutionInfo)>
    where
        T: Outcome,
        F: FnOnce(Arc<ShipClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (_, session) = self.sandboxes.ensure_running(sandbox_id, owner).await?;
        let container = select_container(&session.containers, capability)?;
        let client = self.ships.get_or_create(
            &container.endpoint,
            &container.container_id,
            container.runtime_type,
        )?;

        // Second-line defense after the static profile gate: the runtime's
        // own meta must advertise the capability. A transport failure here
        // means the container died between calls.
        if let Err(err) = client.verify_capability(capability).await {
            if err.code() == ErrorCode::Ship {
                self.recover(sandbox_id, &session).await;
                return Err(BayError::session_not_ready(format!(
                    "runtime for {capability} is unreachable; the session was reclaimed, retry"
                )));
            }
            return Err(err);
        }

        let started_at = now_ms();
        let result = operation(client).await;
        let duration_ms = now_ms() - started_at;

        let success = match &result {
            Ok(outcome) => outcome.succeeded(),
            Err(_) => false,
        };
        let info = ExecutionInfo {
            execution_id: execution_id(),
            execution_time_ms: duration_ms,
            session_id: session.id.clone(),
        };
        self.store
            .insert_execution(&ExecutionRecord {
                id: info.execution_id.clone(),
                sandbox_id: sandbox_id.to_string(),
                session_id: session.id.clone(),
                exec_type: exec_type.to_string(),
                started_at,
                duration_ms,
                success,
                metadata,
            })
            .await?;
        debug!(
            sandbox_id,
            execution_id = %info.execution_id,
            exec_type,
            duration_ms,
            success,
            "capability call recorded"
        );

        match result {
            Ok(outcome) => Ok((outcome, info)),
            Err(err) => {
                if err.code() == ErrorCode::Ship {
                    // Upstream died mid-call; reclaim so the next call gets
                    // a fresh session, and surface the original failure.
                    self.recover(sandbox_id, &session).await;
                }
                Err(err)
            }
        }
    }

    /// Tear down a session observed dead, under the sandbox lock, but only
    /// if it is still the current one.
    async fn recover(&self, sandbox_id: &str, session: &SessionRecord) {
        warn!(sandbox_id, session_id = %session.id, "reclaiming dead session");
        let lock = self.locks.get(sandbox_id);
        let _guard = lock.lock().await;

        let current = match self.store.get_sandbox(sandbox_id).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        if current.current_session_id.as_deref() != Some(session.id.as_str()) {
            return;
        }
        if let Ok(Some(live)) = self.store.get_session(&session.id).await
            && let Err(err) = self.sessions.destroy(&live).await
        {
            warn!(session_id = %session.id, error = %err, "recovery destroy failed");
        }
        if let Err(err) = self
            .store
            .update_sandbox_session(sandbox_id, None, None)
            .await
        {
            warn!(sandbox_id, error = %err, "recovery sandbox update failed");
        }
    }
}

/// The unique provider for a capability: a container declaring it in
/// `primary_for` wins; otherwise the first (declaration order) container
/// declaring it at all.
fn select_container(containers: &[ContainerInfo], capability: Capability) -> Result<&ContainerInfo> {
    if let Some(primary) = containers
        .iter()
        .find(|c| c.primary_for.contains(&capability))
    {
        return Ok(primary);
    }
    containers
        .iter()
        .find(|c| c.capabilities.contains(&capability))
        .ok_or_else(|| {
            BayError::capability_not_supported(format!(
                "no container in this session provides {capability}"
            ))
        })
}
