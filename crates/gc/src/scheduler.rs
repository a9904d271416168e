//! Serial GC cycle scheduling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bay_common::{BayError, Result, now_ms};
use bay_config::GcConfig;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tasks::{self, GcContext, TaskReport};

const TASK_NAMES: [&str; 4] = [
    "idle_session",
    "expired_sandbox",
    "orphan_cargo",
    "orphan_container",
];

/// Seam for multi-replica leadership. Single-replica deployments run with
/// the no-op implementation; a DB-lease implementation can slot in later
/// without touching the tasks.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Whether this replica should run the upcoming cycle.
    async fn try_lead(&self) -> bool;
}

pub struct SingleReplica;

#[async_trait]
impl Coordinator for SingleReplica {
    async fn try_lead(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub at: i64,
    pub reports: Vec<TaskReport>,
}

pub struct GcScheduler {
    ctx: GcContext,
    config: GcConfig,
    coordinator: Arc<dyn Coordinator>,
    cycle: Mutex<()>,
    last_run: RwLock<Option<LastRun>>,
}

impl GcScheduler {
    pub fn new(ctx: GcContext, config: GcConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            ctx,
            config,
            coordinator,
            cycle: Mutex::new(()),
            last_run: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.cycle.try_lock().is_err()
    }

    pub async fn last_run(&self) -> Option<LastRun> {
        self.last_run.read().await.clone()
    }

    /// Run one cycle now. `only` restricts to a subset of task names
    /// (admin trigger); `None` runs every enabled task. Returns `locked`
    /// when a cycle is already in progress.
    pub async fn run_once(&self, only: Option<&[String]>) -> Result<Vec<TaskReport>> {
        if let Some(names) = only {
            for name in names {
                if !TASK_NAMES.contains(&name.as_str()) {
                    return Err(BayError::validation(format!("unknown GC task {name:?}")));
                }
            }
        }
        let Ok(_guard) = self.cycle.try_lock() else {
            return Err(BayError::locked("a GC cycle is already running"));
        };

        let selected = |name: &str| only.is_none_or(|names| names.iter().any(|n| n == name));
        let mut reports = Vec::new();

        if self.config.tasks.idle_session.enabled && selected("idle_session") {
            reports.push(tasks::idle_session(&self.ctx).await);
        }
        if self.config.tasks.expired_sandbox.enabled && selected("expired_sandbox") {
            reports.push(tasks::expired_sandbox(&self.ctx).await);
        }
        if self.config.tasks.orphan_cargo.enabled && selected("orphan_cargo") {
            reports.push(tasks::orphan_cargo(&self.ctx).await);
        }
        if self.config.tasks.orphan_container.enabled && selected("orphan_container") {
            reports.push(tasks::orphan_container(&self.ctx).await);
        }

        let cleaned: u64 = reports.iter().map(|r| r.cleaned).sum();
        let errors: usize = reports.iter().map(|r| r.errors.len()).sum();
        if cleaned > 0 || errors > 0 {
            info!(cleaned, errors, "gc cycle finished");
        }
        *self.last_run.write().await = Some(LastRun {
            at: now_ms(),
            reports: reports.clone(),
        });
        Ok(reports)
    }

    /// Periodic loop; runs until the token is cancelled. One optional
    /// immediate cycle at startup, then one per interval.
    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        if self.config.run_on_startup {
            self.tick().await;
        }
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the startup run
        // is not doubled.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.cancelled() => {
                    info!("gc loop stopped");
                    return;
                }
            }
        }
    }

    async fn tick(&self) {
        if !self.coordinator.try_lead().await {
            return;
        }
        match self.run_once(None).await {
            Ok(_) => {}
            Err(err) if err.code() == bay_common::ErrorCode::Locked => {
                // Previous cycle still running; skip this tick.
            }
            Err(err) => warn!(error = %err, "gc cycle failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use bay_config::BayConfig;
    use bay_core::{CargoManager, SandboxLocks, SandboxManager, SessionManager, Store};
    use bay_driver::LabelSchema;
    use bay_driver::testing::MemoryDriver;
    use bay_ship::ShipCache;

    use super::*;

    async fn scheduler() -> Arc<GcScheduler> {
        let config = Arc::new(BayConfig::default());
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let driver = Arc::new(MemoryDriver::new("http://127.0.0.1:1"));
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
            Arc::clone(&config),
            Arc::clone(&cargos),
            Arc::clone(&sessions),
            Arc::clone(&locks),
        ));
        let ctx = GcContext {
            store,
            driver,
            sandboxes,
            sessions,
            cargos,
            locks,
            schema,
            instance_id: "unit".into(),
        };
        Arc::new(GcScheduler::new(
            ctx,
            config.gc.clone(),
            Arc::new(SingleReplica),
        ))
    }

    #[tokio::test]
    async fn run_once_reports_default_enabled_tasks_in_order() {
        let scheduler = scheduler().await;
        let reports = scheduler.run_once(None).await.unwrap();
        let names: Vec<&str> = reports.iter().map(|r| r.task.as_str()).collect();
        // orphan_container is disabled by default.
        assert_eq!(names, vec!["idle_session", "expired_sandbox", "orphan_cargo"]);
        assert!(scheduler.last_run().await.is_some());
    }

    #[tokio::test]
    async fn run_once_rejects_unknown_task_names() {
        let scheduler = scheduler().await;
        let tasks = ["idle_session".to_string(), "bogus".to_string()];
        let err = scheduler
            .run_once(Some(tasks.as_slice()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), bay_common::ErrorCode::Validation);
    }

    #[tokio::test]
    async fn run_once_filters_to_requested_tasks() {
        let scheduler = scheduler().await;
        let tasks = ["idle_session".to_string()];
        let reports = scheduler
            .run_once(Some(tasks.as_slice()))
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task, "idle_session");
    }
}
