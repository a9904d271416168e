//! Top-level sandbox lifecycle.
//!
//! Every mutating operation takes the per-sandbox lock and then re-fetches
//! the row before acting; rows read before the lock are stale by definition.

use std::sync::Arc;

use bay_common::{BayError, Page, Result, now_ms, sandbox_id};
use bay_config::{BayConfig, Profile};
use tracing::{info, warn};

use crate::cargo_manager::CargoManager;
use crate::locks::SandboxLocks;
use crate::model::{CargoRecord, SandboxRecord, SandboxStatus, SessionRecord};
use crate::session_manager::SessionManager;
use crate::store::Store;

pub struct SandboxManager {
    store: Arc<Store>,
    config: Arc<BayConfig>,
    cargos: Arc<CargoManager>,
    sessions: Arc<SessionManager>,
    locks: Arc<SandboxLocks>,
}

impl SandboxManager {
    pub fn new(
        store: Arc<Store>,
        config: Arc<BayConfig>,
        cargos: Arc<CargoManager>,
        sessions: Arc<SessionManager>,
        locks: Arc<SandboxLocks>,
    ) -> Self {
        Self {
            store,
            config,
            cargos,
            sessions,
            locks,
        }
    }

    pub fn profile_for(&self, sandbox: &SandboxRecord) -> Result<&Profile> {
        self.config.profile(&sandbox.profile_id).ok_or_else(|| {
            BayError::internal(format!(
                "sandbox {} references unknown profile {:?}",
                sandbox.id, sandbox.profile_id
            ))
        })
    }

    /// Create the durable handle. No container is started here.
    pub async fn create(
        &self,
        owner: &str,
        profile_id: Option<&str>,
        cargo_ref: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<(SandboxRecord, &Profile)> {
        let profile = match profile_id {
            Some(id) => self
                .config
                .profile(id)
                .ok_or_else(|| BayError::validation(format!("unknown profile {id:?}")))?,
            None => self.config.default_profile(),
        };

        let id = sandbox_id();
        let cargo = match cargo_ref {
            Some(cargo_id) => {
                let cargo = self.cargos.get(cargo_id, owner).await?;
                if cargo.managed {
                    return Err(BayError::conflict(format!(
                        "cargo {cargo_id} is managed by another sandbox and cannot be shared"
                    )));
                }
                cargo
            }
            None => self.cargos.create(owner, true, Some(id.as_str()), None).await?,
        };

        let now = now_ms();
        let record = SandboxRecord {
            id: id.clone(),
            owner: owner.to_string(),
            profile_id: profile.id.clone(),
            cargo_id: cargo.id.clone(),
            current_session_id: None,
            created_at: now,
            expires_at: ttl_seconds.map(|ttl| now + (ttl as i64).saturating_mul(1000)),
            idle_expires_at: None,
            deleted_at: None,
        };

        if let Err(err) = self.store.insert_sandbox(&record).await {
            if cargo.managed {
                // Orphan-cargo GC would also reap this, but clean up inline
                // while we still know about it.
                if let Err(cleanup) = self.cargos.delete_internal_by_id(&cargo.id).await {
                    warn!(cargo_id = %cargo.id, error = %cleanup, "cargo rollback failed");
                }
            }
            return Err(err);
        }
        self.cargos.touch(&cargo.id).await?;
        info!(sandbox_id = %id, owner, profile = %profile.id, "sandbox created");
        Ok((record, profile))
    }

    pub async fn get(&self, id: &str, owner: &str) -> Result<(SandboxRecord, SandboxStatus)> {
        let record = self
            .store
            .get_sandbox_for_owner(id, owner)
            .await?
            .ok_or_else(|| BayError::not_found(format!("sandbox {id} not found")))?;
        let status = self.status_of(&record).await?;
        Ok((record, status))
    }

    pub async fn status_of(&self, record: &SandboxRecord) -> Result<SandboxStatus> {
        let session_status = match &record.current_session_id {
            Some(session_id) => self
                .store
                .get_session(session_id)
                .await?
                .map(|session| session.status),
            None => None,
        };
        Ok(record.status(session_status, now_ms()))
    }

    /// Status is computed, so a status filter applies to the fetched page
    /// rather than the SQL predicate.
    pub async fn list(
        &self,
        owner: &str,
        status_filter: Option<SandboxStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Page<(SandboxRecord, SandboxStatus)>> {
        let rows = self.store.list_sandboxes(owner, offset, limit + 1).await?;
        let page = Page::from_rows(rows, offset, limit);
        let mut items = Vec::with_capacity(page.items.len());
        for record in page.items {
            let status = self.status_of(&record).await?;
            if status_filter.is_none_or(|filter| filter == status) {
                items.push((record, status));
            }
        }
        Ok(Page {
            items,
            next_cursor: page.next_cursor,
        })
    }

    /// Lazy compute: make sure a ready session exists and reset the idle
    /// clock. Called for every capability invocation.
    pub async fn ensure_running(
        &self,
        id: &str,
        owner: &str,
    ) -> Result<(SandboxRecord, SessionRecord)> {
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let record = self.fresh(id, owner).await?;
        if record.is_expired(now_ms()) {
            return Err(BayError::sandbox_expired(format!("sandbox {id} has expired")));
        }
        let profile = self.profile_for(&record)?;
        let cargo = self.cargo_of(&record).await?;

        let session = self.sessions.ensure(&record, profile, &cargo).await?;

        // Activity resets the idle clock even when the session already ran.
        let idle_expires_at = now_ms() + (profile.idle_timeout as i64).saturating_mul(1000);
        self.store
            .update_sandbox_idle(id, Some(idle_expires_at))
            .await?;
        self.cargos.touch(&record.cargo_id).await?;

        let refreshed = self.store.get_sandbox(id).await?.unwrap_or(record);
        Ok((refreshed, session))
    }

    pub async fn extend_ttl(
        &self,
        id: &str,
        owner: &str,
        extend_by_seconds: u64,
    ) -> Result<SandboxRecord> {
        if extend_by_seconds == 0 {
            return Err(BayError::validation("extend_by must be positive"));
        }
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let record = self.fresh(id, owner).await?;
        let now = now_ms();
        let Some(expires_at) = record.expires_at else {
            return Err(BayError::ttl_infinite(format!(
                "sandbox {id} has no TTL to extend"
            )));
        };
        if expires_at < now {
            return Err(BayError::sandbox_expired(format!(
                "sandbox {id} expired and can no longer be extended"
            )));
        }

        let new_expires_at =
            expires_at.max(now) + (extend_by_seconds as i64).saturating_mul(1000);
        self.store.update_sandbox_expiry(id, new_expires_at).await?;
        self.fresh(id, owner).await
    }

    /// Reset the idle clock without touching the TTL or starting compute.
    pub async fn keepalive(&self, id: &str, owner: &str) -> Result<()> {
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let record = self.fresh(id, owner).await?;
        let profile = self.profile_for(&record)?;
        let idle_expires_at = now_ms() + (profile.idle_timeout as i64).saturating_mul(1000);
        self.store
            .update_sandbox_idle(id, Some(idle_expires_at))
            .await
    }

    /// Release compute; cargo and files stay. Idempotent.
    pub async fn stop(&self, id: &str, owner: &str) -> Result<()> {
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let record = self.fresh(id, owner).await?;
        self.teardown_session(&record).await?;
        self.store.update_sandbox_session(id, None, None).await?;
        info!(sandbox_id = %id, "sandbox stopped");
        Ok(())
    }

    /// Soft-delete the sandbox, destroy its compute, cascade its managed
    /// cargo. External cargo is left alone.
    pub async fn delete(&self, id: &str, owner: &str) -> Result<()> {
        {
            let lock = self.locks.get(id);
            let _guard = lock.lock().await;

            let record = self.fresh(id, owner).await?;
            self.teardown_session(&record).await?;
            self.store.mark_sandbox_deleted(id, now_ms()).await?;

            if let Some(cargo) = self.store.get_cargo(&record.cargo_id).await?
                && cargo.managed
                && cargo.managed_by_sandbox_id.as_deref() == Some(id)
                && let Err(err) = self.cargos.delete(&cargo.id, owner, true).await
            {
                // The sandbox is already gone; the cargo is now an orphan
                // and the next GC cycle will retry.
                warn!(cargo_id = %cargo.id, error = %err, "managed cargo cascade failed");
            }
            info!(sandbox_id = %id, "sandbox deleted");
        }
        self.locks.purge(id);
        Ok(())
    }

    /// GC hook: full delete for a sandbox already known to be TTL-expired.
    /// Caller holds the lock and has re-checked the predicate.
    pub async fn delete_expired_locked(&self, record: &SandboxRecord) -> Result<()> {
        self.teardown_session(record).await?;
        self.store.mark_sandbox_deleted(&record.id, now_ms()).await?;
        if let Some(cargo) = self.store.get_cargo(&record.cargo_id).await?
            && cargo.managed
            && cargo.managed_by_sandbox_id.as_deref() == Some(record.id.as_str())
        {
            self.cargos.delete_internal_by_id(&cargo.id).await?;
        }
        Ok(())
    }

    async fn teardown_session(&self, record: &SandboxRecord) -> Result<()> {
        if let Some(session_id) = &record.current_session_id
            && let Some(session) = self.store.get_session(session_id).await?
        {
            self.sessions.destroy(&session).await?;
        }
        Ok(())
    }

    async fn fresh(&self, id: &str, owner: &str) -> Result<SandboxRecord> {
        self.store
            .get_sandbox_for_owner(id, owner)
            .await?
            .ok_or_else(|| BayError::not_found(format!("sandbox {id} not found")))
    }

    async fn cargo_of(&self, record: &SandboxRecord) -> Result<CargoRecord> {
        self.store
            .get_cargo(&record.cargo_id)
            .await?
            .ok_or_else(|| {
                BayError::internal(format!(
                    "sandbox {} references missing cargo {}",
                    record.id, record.cargo_id
                ))
            })
    }
}
