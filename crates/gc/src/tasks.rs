//! The four GC tasks.

use std::sync::Arc;

use bay_common::now_ms;
use bay_core::{CargoManager, SandboxLocks, SandboxManager, SessionManager, Store};
use bay_driver::{Driver, LabelSchema, LabelVerdict};
use serde::Serialize;
use tracing::{info, warn};

/// Everything a task needs; shared by the scheduler and the admin trigger.
pub struct GcContext {
    pub store: Arc<Store>,
    pub driver: Arc<dyn Driver>,
    pub sandboxes: Arc<SandboxManager>,
    pub sessions: Arc<SessionManager>,
    pub cargos: Arc<CargoManager>,
    pub locks: Arc<SandboxLocks>,
    pub schema: LabelSchema,
    pub instance_id: String,
}

/// Per-task outcome: partial failures are collected, never fatal.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub cleaned: u64,
    pub errors: Vec<String>,
}

impl TaskReport {
    fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            cleaned: 0,
            errors: Vec::new(),
        }
    }
}

/// Reclaim sessions whose sandbox sat idle past its timeout. Files stay;
/// the sandbox drops back to idle and the next capability call
/// reprovisions.
pub async fn idle_session(ctx: &GcContext) -> TaskReport {
    let mut report = TaskReport::new("idle_session");
    let now = now_ms();
    let candidates = match ctx.store.sandboxes_with_idle_expired(now).await {
        Ok(rows) => rows,
        Err(err) => {
            report.errors.push(format!("select: {err}"));
            return report;
        }
    };

    for candidate in candidates {
        let lock = ctx.locks.get(&candidate.id);
        let _guard = lock.lock().await;

        // Re-check under the lock: a keepalive or capability call may have
        // pushed the idle clock forward since the select.
        let fresh = match ctx.store.get_sandbox(&candidate.id).await {
            Ok(Some(row)) => row,
            Ok(None) => continue,
            Err(err) => {
                report.errors.push(format!("{}: refetch: {err}", candidate.id));
                continue;
            }
        };
        if fresh.is_deleted() || !fresh.idle_expires_at.is_some_and(|at| at < now_ms()) {
            continue;
        }

        if let Some(session_id) = &fresh.current_session_id {
            match ctx.store.get_session(session_id).await {
                Ok(Some(session)) => {
                    if let Err(err) = ctx.sessions.destroy(&session).await {
                        report.errors.push(format!("{}: destroy: {err}", fresh.id));
                        continue;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    report.errors.push(format!("{}: session: {err}", fresh.id));
                    continue;
                }
            }
        }
        if let Err(err) = ctx
            .store
            .update_sandbox_session(&fresh.id, None, None)
            .await
        {
            report.errors.push(format!("{}: clear: {err}", fresh.id));
            continue;
        }
        info!(sandbox_id = %fresh.id, "idle session reclaimed");
        report.cleaned += 1;
    }
    report
}

/// Fully delete sandboxes past their absolute TTL.
pub async fn expired_sandbox(ctx: &GcContext) -> TaskReport {
    let mut report = TaskReport::new("expired_sandbox");
    let now = now_ms();
    let candidates = match ctx.store.sandboxes_with_ttl_expired(now).await {
        Ok(rows) => rows,
        Err(err) => {
            report.errors.push(format!("select: {err}"));
            return report;
        }
    };

    for candidate in candidates {
        let lock = ctx.locks.get(&candidate.id);
        let _guard = lock.lock().await;

        // An extend_ttl racing this cycle moves expires_at forward; the
        // re-check sees it and skips.
        let fresh = match ctx.store.get_sandbox(&candidate.id).await {
            Ok(Some(row)) => row,
            Ok(None) => continue,
            Err(err) => {
                report.errors.push(format!("{}: refetch: {err}", candidate.id));
                continue;
            }
        };
        if fresh.is_deleted() || !fresh.is_expired(now_ms()) {
            continue;
        }

        match ctx.sandboxes.delete_expired_locked(&fresh).await {
            Ok(()) => {
                info!(sandbox_id = %fresh.id, "expired sandbox deleted");
                report.cleaned += 1;
            }
            Err(err) => report.errors.push(format!("{}: delete: {err}", fresh.id)),
        }
    }
    report
}

/// Managed cargos whose owning sandbox is gone or soft-deleted.
pub async fn orphan_cargo(ctx: &GcContext) -> TaskReport {
    let mut report = TaskReport::new("orphan_cargo");
    let orphans = match ctx.store.orphan_managed_cargos().await {
        Ok(rows) => rows,
        Err(err) => {
            report.errors.push(format!("select: {err}"));
            return report;
        }
    };
    for cargo in orphans {
        match ctx.cargos.delete_internal_by_id(&cargo.id).await {
            Ok(()) => {
                info!(cargo_id = %cargo.id, "orphan cargo deleted");
                report.cleaned += 1;
            }
            Err(err) => report.errors.push(format!("{}: {err}", cargo.id)),
        }
    }
    report
}

/// Strict mode: list platform-marked containers broadly, then verify the
/// full label set and instance id ourselves. Anything that fails
/// verification is logged and left untouched; a verified container whose
/// session no longer exists in the database is destroyed.
pub async fn orphan_container(ctx: &GcContext) -> TaskReport {
    let mut report = TaskReport::new("orphan_container");
    let instances = match ctx
        .driver
        .list_runtime_instances(&ctx.schema.managed_filter())
        .await
    {
        Ok(instances) => instances,
        Err(err) => {
            report.errors.push(format!("list: {err}"));
            return report;
        }
    };

    for instance in instances {
        let session_id = match ctx.schema.verify_container(&instance.labels, &ctx.instance_id) {
            LabelVerdict::Owned { session_id } => session_id,
            LabelVerdict::Untrusted { reason } => {
                warn!(
                    instance_id = %instance.id,
                    name = %instance.name,
                    reason,
                    "skip_untrusted"
                );
                continue;
            }
        };

        match ctx.store.session_exists(&session_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => {
                report.errors.push(format!("{}: lookup: {err}", instance.id));
                continue;
            }
        }

        match ctx.driver.destroy_runtime_instance(&instance.id).await {
            Ok(()) => {
                info!(
                    instance_id = %instance.id,
                    session_id,
                    "orphan container destroyed"
                );
                report.cleaned += 1;
            }
            Err(err) => report.errors.push(format!("{}: destroy: {err}", instance.id)),
        }
    }
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use bay_config::BayConfig;
    use bay_driver::RuntimeInstance;
    use bay_driver::testing::MemoryDriver;
    use bay_ship::ShipCache;

    use super::*;

    struct Fixture {
        ctx: GcContext,
        sandboxes: Arc<SandboxManager>,
        driver: Arc<MemoryDriver>,
        _server: mockito::ServerGuard,
    }

    async fn fixture() -> Fixture {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "ok"}"#)
            .create_async()
            .await;

        let config = Arc::new(BayConfig::default());
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let driver = Arc::new(MemoryDriver::new(server.url()));
        let schema = LabelSchema::new("bay");
        let locks = Arc::new(SandboxLocks::new());
        let cargos = Arc::new(CargoManager::new(
            Arc::clone(&store),
            driver.clone(),
            schema.clone(),
            config.cargo.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            driver.clone(),
            Arc::new(ShipCache::new()),
            schema.clone(),
            "unit".into(),
            Duration::from_secs(5),
        ));
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::clone(&store),
            config,
            Arc::clone(&cargos),
            Arc::clone(&sessions),
            Arc::clone(&locks),
        ));
        let ctx = GcContext {
            store,
            driver: driver.clone(),
            sandboxes: Arc::clone(&sandboxes),
            sessions,
            cargos,
            locks,
            schema,
            instance_id: "unit".into(),
        };
        Fixture {
            ctx,
            sandboxes,
            driver,
            _server: server,
        }
    }

    #[tokio::test]
    async fn idle_session_reclaims_and_leaves_sandbox_idle() {
        let fx = fixture().await;
        let (record, _) = fx.sandboxes.create("o", None, None, None).await.unwrap();
        fx.sandboxes.ensure_running(&record.id, "o").await.unwrap();
        assert_eq!(fx.driver.container_count(), 1);

        // Push the idle clock into the past.
        fx.ctx
            .store
            .update_sandbox_idle(&record.id, Some(now_ms() - 1_000))
            .await
            .unwrap();

        let report = idle_session(&fx.ctx).await;
        assert_eq!(report.cleaned, 1);
        assert!(report.errors.is_empty());
        assert_eq!(fx.driver.container_count(), 0);

        let row = fx.ctx.store.get_sandbox(&record.id).await.unwrap().unwrap();
        assert!(row.current_session_id.is_none());
        assert!(row.idle_expires_at.is_none());
        // Cargo untouched.
        assert_eq!(fx.driver.volume_count(), 1);
    }

    #[tokio::test]
    async fn idle_session_respects_a_raced_keepalive() {
        let fx = fixture().await;
        let (record, _) = fx.sandboxes.create("o", None, None, None).await.unwrap();
        fx.sandboxes.ensure_running(&record.id, "o").await.unwrap();
        fx.sandboxes.keepalive(&record.id, "o").await.unwrap();

        let report = idle_session(&fx.ctx).await;
        assert_eq!(report.cleaned, 0);
        assert_eq!(fx.driver.container_count(), 1);
    }

    #[tokio::test]
    async fn expired_sandbox_cascades_the_full_delete() {
        let fx = fixture().await;
        let (record, _) = fx
            .sandboxes
            .create("o", None, None, Some(1))
            .await
            .unwrap();
        fx.sandboxes.ensure_running(&record.id, "o").await.unwrap();

        // Wait out the one-second TTL.
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let report = expired_sandbox(&fx.ctx).await;
        assert_eq!(report.cleaned, 1);
        assert_eq!(fx.driver.container_count(), 0);
        assert_eq!(fx.driver.volume_count(), 0);
        let row = fx.ctx.store.get_sandbox(&record.id).await.unwrap().unwrap();
        assert!(row.is_deleted());
    }

    #[tokio::test]
    async fn orphan_cargo_reaps_cargos_of_deleted_sandboxes() {
        let fx = fixture().await;
        let (record, _) = fx.sandboxes.create("o", None, None, None).await.unwrap();
        // Soft-delete the sandbox without the cascade.
        fx.ctx
            .store
            .mark_sandbox_deleted(&record.id, now_ms())
            .await
            .unwrap();
        assert_eq!(fx.driver.volume_count(), 1);

        let report = orphan_cargo(&fx.ctx).await;
        assert_eq!(report.cleaned, 1);
        assert_eq!(fx.driver.volume_count(), 0);
    }

    #[tokio::test]
    async fn orphan_container_never_touches_untrusted_instances() {
        let fx = fixture().await;

        // Foreign instance id, otherwise fully labeled.
        let mut foreign: HashMap<String, String> = HashMap::from([
            ("bay.managed".into(), "true".into()),
            ("bay.owner".into(), "o".into()),
            ("bay.sandbox_id".into(), "sb_x".into()),
            ("bay.session_id".into(), "sess_x".into()),
            ("bay.cargo_id".into(), "cg_x".into()),
            ("bay.profile_id".into(), "p".into()),
            ("bay.instance_id".into(), "other".into()),
        ]);
        fx.driver.inject_instance(RuntimeInstance {
            id: "foreign-1".into(),
            name: "bay-session-xyz".into(),
            labels: foreign.clone(),
            state: "running".into(),
        });

        // Missing a required label.
        foreign.remove("bay.cargo_id");
        foreign.insert("bay.instance_id".into(), "unit".into());
        fx.driver.inject_instance(RuntimeInstance {
            id: "partial-1".into(),
            name: "looks-like-ours".into(),
            labels: foreign,
            state: "running".into(),
        });

        // Fully labeled, right instance, but the session does not exist.
        let stale: HashMap<String, String> = HashMap::from([
            ("bay.managed".into(), "true".into()),
            ("bay.owner".into(), "o".into()),
            ("bay.sandbox_id".into(), "sb_gone".into()),
            ("bay.session_id".into(), "sess_gone".into()),
            ("bay.cargo_id".into(), "cg_gone".into()),
            ("bay.profile_id".into(), "p".into()),
            ("bay.instance_id".into(), "unit".into()),
        ]);
        fx.driver.inject_instance(RuntimeInstance {
            id: "stale-1".into(),
            name: "bay-sess-gone-main".into(),
            labels: stale,
            state: "running".into(),
        });

        let report = orphan_container(&fx.ctx).await;
        assert_eq!(report.cleaned, 1);
        assert!(fx.driver.instance_present("foreign-1"));
        assert!(fx.driver.instance_present("partial-1"));
        assert!(!fx.driver.instance_present("stale-1"));
    }

    #[tokio::test]
    async fn orphan_container_spares_live_sessions() {
        let fx = fixture().await;
        let (record, _) = fx.sandboxes.create("o", None, None, None).await.unwrap();
        fx.sandboxes.ensure_running(&record.id, "o").await.unwrap();

        let report = orphan_container(&fx.ctx).await;
        assert_eq!(report.cleaned, 0);
        assert_eq!(fx.driver.container_count(), 1);
    }
}
