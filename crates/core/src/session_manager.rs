//! Session lifecycle: reifying a sandbox's containers.
//!
//! Every entry point here assumes the caller holds the per-sandbox lock and
//! passes freshly-fetched rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bay_common::{BayError, Result, now_ms, session_id};
use bay_config::{ContainerSpec, Profile, StartupOrder};
use bay_driver::{CreateContext, Driver, LabelSchema};
use bay_ship::ShipCache;
use futures::future::join_all;
use tracing::{info, warn};

use crate::model::{CargoRecord, ContainerInfo, SandboxRecord, SessionRecord, SessionStatus};
use crate::store::Store;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SessionManager {
    store: Arc<Store>,
    driver: Arc<dyn Driver>,
    ships: Arc<ShipCache>,
    schema: LabelSchema,
    instance_id: String,
    start_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        driver: Arc<dyn Driver>,
        ships: Arc<ShipCache>,
        schema: LabelSchema,
        instance_id: String,
        start_timeout: Duration,
    ) -> Self {
        Self {
            store,
            driver,
            ships,
            schema,
            instance_id,
            start_timeout,
        }
    }

    /// Return the sandbox's ready session, provisioning one if needed.
    /// Caller holds the sandbox lock.
    pub async fn ensure(
        &self,
        sandbox: &SandboxRecord,
        profile: &Profile,
        cargo: &CargoRecord,
    ) -> Result<SessionRecord> {
        if let Some(current) = &sandbox.current_session_id {
            if let Some(session) = self.store.get_session(current).await? {
                if session.status == SessionStatus::Ready {
                    return Ok(session);
                }
                // A session stuck in starting/failed from an earlier crash:
                // tear it down and reprovision.
                warn!(
                    sandbox_id = %sandbox.id,
                    session_id = %session.id,
                    status = session.status.as_str(),
                    "replacing non-ready session"
                );
                self.destroy(&session).await?;
            }
            self.store
                .update_sandbox_session(&sandbox.id, None, None)
                .await?;
        }
        self.provision(sandbox, profile, cargo).await
    }

    async fn provision(
        &self,
        sandbox: &SandboxRecord,
        profile: &Profile,
        cargo: &CargoRecord,
    ) -> Result<SessionRecord> {
        let id = session_id();
        let record = SessionRecord {
            id: id.clone(),
            sandbox_id: sandbox.id.clone(),
            profile_id: profile.id.clone(),
            status: SessionStatus::Starting,
            containers: Vec::new(),
            created_at: now_ms(),
        };
        // The row exists from `starting` onward so concurrent reads see the
        // sandbox as starting rather than idle.
        self.store.insert_session(&record).await?;
        self.store
            .update_sandbox_session(&sandbox.id, Some(id.as_str()), None)
            .await?;

        let ctx = CreateContext {
            owner: sandbox.owner.clone(),
            sandbox_id: sandbox.id.clone(),
            session_id: id.clone(),
            cargo_id: cargo.id.clone(),
            profile_id: profile.id.clone(),
            instance_id: self.instance_id.clone(),
        };

        match self.start_containers(&ctx, profile, cargo).await {
            Ok(containers) => {
                self.store.update_session_ready(&id, &containers).await?;
                let idle_expires_at =
                    now_ms() + (profile.idle_timeout as i64).saturating_mul(1000);
                self.store
                    .update_sandbox_session(&sandbox.id, Some(id.as_str()), Some(idle_expires_at))
                    .await?;
                info!(
                    sandbox_id = %sandbox.id,
                    session_id = %id,
                    containers = containers.len(),
                    "session ready"
                );
                Ok(SessionRecord {
                    status: SessionStatus::Ready,
                    containers,
                    ..record
                })
            }
            Err((err, created)) => {
                self.rollback(&sandbox.id, &id, &created).await;
                Err(err)
            }
        }
    }

    /// Create, start, and health-gate every container in the profile.
    /// On failure returns the error plus every container id created so far
    /// so the caller can roll back.
    async fn start_containers(
        &self,
        ctx: &CreateContext,
        profile: &Profile,
        cargo: &CargoRecord,
    ) -> std::result::Result<Vec<ContainerInfo>, (BayError, Vec<String>)> {
        let mut created: Vec<String> = Vec::new();

        // Create phase.
        match profile.startup.order {
            StartupOrder::Sequential => {
                for spec in &profile.containers {
                    match self.create_one(ctx, profile, spec, cargo).await {
                        Ok(container_id) => created.push(container_id),
                        Err(err) => return Err((err, created)),
                    }
                }
            }
            StartupOrder::Parallel => {
                let results = join_all(
                    profile
                        .containers
                        .iter()
                        .map(|spec| self.create_one(ctx, profile, spec, cargo)),
                )
                .await;
                let mut first_error = None;
                for result in results {
                    match result {
                        Ok(container_id) => created.push(container_id),
                        Err(err) => first_error = first_error.or(Some(err)),
                    }
                }
                if let Some(err) = first_error {
                    return Err((err, created));
                }
            }
        }

        // Start phase, parallel regardless of create ordering.
        let starts = join_all(profile.containers.iter().zip(&created).map(
            |(spec, container_id)| async move {
                self.driver
                    .start(container_id, spec.runtime_port)
                    .await
                    .map_err(|err| {
                        BayError::session_not_ready(format!(
                            "container {} failed to start: {err}",
                            spec.name
                        ))
                    })
            },
        ))
        .await;
        let mut endpoints = Vec::with_capacity(starts.len());
        for result in starts {
            match result {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => return Err((err, created)),
            }
        }

        // Readiness phase: poll each runtime's health until it reports
        // ready (browser runtimes gate on warm-up via `browser_ready`).
        let checks = join_all(
            profile
                .containers
                .iter()
                .zip(&created)
                .zip(&endpoints)
                .map(|((spec, container_id), endpoint)| {
                    self.await_ready(spec, container_id, endpoint)
                }),
        )
        .await;
        for result in checks {
            if let Err(err) = result {
                return Err((err, created));
            }
        }

        let containers = profile
            .containers
            .iter()
            .zip(&created)
            .zip(&endpoints)
            .map(|((spec, container_id), endpoint)| ContainerInfo {
                name: spec.name.clone(),
                container_id: container_id.clone(),
                endpoint: endpoint.clone(),
                runtime_type: spec.runtime_type,
                runtime_port: spec.runtime_port,
                capabilities: spec.capabilities.clone(),
                primary_for: spec.primary_for.clone(),
            })
            .collect();
        Ok(containers)
    }

    async fn create_one(
        &self,
        ctx: &CreateContext,
        profile: &Profile,
        spec: &ContainerSpec,
        cargo: &CargoRecord,
    ) -> Result<String> {
        let labels = self.schema.container_labels(ctx, spec.runtime_port);
        let mut env: HashMap<String, String> = profile.env.clone();
        env.extend(spec.env.clone());
        self.driver
            .create(ctx, spec, &cargo.driver_ref, &labels, &env)
            .await
            .map_err(|err| {
                BayError::session_not_ready(format!(
                    "container {} could not be created: {err}",
                    spec.name
                ))
            })
    }

    async fn await_ready(
        &self,
        spec: &ContainerSpec,
        container_id: &str,
        endpoint: &str,
    ) -> Result<()> {
        let client = self
            .ships
            .get_or_create(endpoint, container_id, spec.runtime_type)?;
        let poll = async {
            loop {
                match client.health().await {
                    Ok(health) if health.is_ready() => return,
                    _ => tokio::time::sleep(READINESS_POLL_INTERVAL).await,
                }
            }
        };
        tokio::time::timeout(self.start_timeout, poll)
            .await
            .map_err(|_| {
                BayError::session_not_ready(format!(
                    "container {} did not become ready within {}s",
                    spec.name,
                    self.start_timeout.as_secs()
                ))
            })
    }

    /// Undo a partial provision: containers, session row, sandbox pointer.
    async fn rollback(&self, sandbox_id: &str, session_id: &str, created: &[String]) {
        for container_id in created {
            // Capture a log tail before the container disappears; it is the
            // only startup diagnostic that survives the rollback.
            if let Ok(tail) = self.driver.logs(container_id, 50).await
                && !tail.is_empty()
            {
                warn!(container_id, logs = %tail, "container output before rollback");
            }
            self.ships.purge_container(container_id);
            if let Err(err) = self.driver.destroy(container_id).await {
                warn!(container_id, error = %err, "rollback destroy failed");
            }
        }
        if let Err(err) = self.store.delete_session(session_id).await {
            warn!(session_id, error = %err, "rollback session delete failed");
        }
        if let Err(err) = self
            .store
            .update_sandbox_session(sandbox_id, None, None)
            .await
        {
            warn!(sandbox_id, error = %err, "rollback sandbox update failed");
        }
    }

    /// Destroy all containers (collecting errors rather than aborting) and
    /// remove the session row.
    pub async fn destroy(&self, session: &SessionRecord) -> Result<()> {
        let mut failures = 0usize;
        for container in &session.containers {
            self.ships.purge_container(&container.container_id);
            if let Err(err) = self.driver.destroy(&container.container_id).await {
                failures += 1;
                warn!(
                    session_id = %session.id,
                    container_id = %container.container_id,
                    error = %err,
                    "container destroy failed"
                );
            }
        }
        self.store.delete_session(&session.id).await?;
        if failures > 0 {
            warn!(
                session_id = %session.id,
                failures,
                "session destroyed with container errors; orphan GC will reap leftovers"
            );
        }
        Ok(())
    }

    /// Compute-layer stop is a destroy: session rows are not retained after
    /// reclaim.
    pub async fn stop(&self, session: &SessionRecord) -> Result<()> {
        self.destroy(session).await
    }
}
