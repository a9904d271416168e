//! Cargo (persistent volume) lifecycle.

use std::sync::Arc;

use bay_common::{BayError, Page, Result, cargo_id, now_ms};
use bay_config::CargoConfig;
use bay_driver::{Driver, DriverError, LabelSchema};
use tracing::{info, warn};

use crate::model::CargoRecord;
use crate::store::Store;

pub struct CargoManager {
    store: Arc<Store>,
    driver: Arc<dyn Driver>,
    schema: LabelSchema,
    defaults: CargoConfig,
}

/// Driver volume names must satisfy both engines' naming rules; ids carry
/// an underscore, so it is swapped out.
fn volume_name(id: &str) -> String {
    format!("bay-{}", id.replace('_', "-"))
}

impl CargoManager {
    pub fn new(
        store: Arc<Store>,
        driver: Arc<dyn Driver>,
        schema: LabelSchema,
        defaults: CargoConfig,
    ) -> Self {
        Self {
            store,
            driver,
            schema,
            defaults,
        }
    }

    pub async fn create(
        &self,
        owner: &str,
        managed: bool,
        managed_by_sandbox_id: Option<&str>,
        size_limit_mb: Option<u64>,
    ) -> Result<CargoRecord> {
        let id = cargo_id();
        let size = size_limit_mb.unwrap_or(self.defaults.default_size_limit_mb);
        let labels = self.schema.volume_labels(owner, &id);
        let driver_ref = self
            .driver
            .create_volume(&volume_name(&id), &labels, Some(size))
            .await
            .map_err(driver_to_platform)?;

        let now = now_ms();
        let record = CargoRecord {
            id: id.clone(),
            owner: owner.to_string(),
            managed,
            managed_by_sandbox_id: managed_by_sandbox_id.map(str::to_string),
            backend: self.driver.kind().to_string(),
            driver_ref: driver_ref.clone(),
            size_limit_mb: Some(size as i64),
            created_at: now,
            last_accessed_at: now,
        };

        if let Err(err) = self.store.insert_cargo(&record).await {
            // The volume exists but the row does not; remove the volume so
            // nothing leaks outside the database's view.
            if let Err(cleanup) = self.driver.delete_volume(&driver_ref).await {
                warn!(cargo_id = %id, error = %cleanup, "failed to roll back volume after db error");
            }
            return Err(err);
        }
        info!(cargo_id = %id, owner, managed, "cargo created");
        Ok(record)
    }

    /// 404 covers both "missing" and "not yours".
    pub async fn get(&self, id: &str, owner: &str) -> Result<CargoRecord> {
        self.store
            .get_cargo_for_owner(id, owner)
            .await?
            .ok_or_else(|| BayError::not_found(format!("cargo {id} not found")))
    }

    pub async fn list(
        &self,
        owner: &str,
        managed_filter: Option<bool>,
        offset: u64,
        limit: u64,
    ) -> Result<Page<CargoRecord>> {
        let rows = self
            .store
            .list_cargos(owner, managed_filter, offset, limit + 1)
            .await?;
        Ok(Page::from_rows(rows, offset, limit))
    }

    pub async fn delete(&self, id: &str, owner: &str, force: bool) -> Result<()> {
        let cargo = self.get(id, owner).await?;

        if cargo.managed {
            // Managed cargos die with their sandbox. Direct deletion is only
            // allowed for the cascade (force) or when the owning sandbox is
            // already gone.
            if !force {
                let owner_gone = match &cargo.managed_by_sandbox_id {
                    Some(sandbox_id) => self
                        .store
                        .get_sandbox(sandbox_id)
                        .await?
                        .is_none_or(|sb| sb.is_deleted()),
                    None => true,
                };
                if !owner_gone {
                    return Err(BayError::conflict(format!(
                        "cargo {id} is managed by sandbox {}; delete the sandbox instead",
                        cargo.managed_by_sandbox_id.as_deref().unwrap_or("?")
                    )));
                }
            }
        } else {
            let blocking = self.store.sandboxes_referencing_cargo(id).await?;
            if !blocking.is_empty() {
                return Err(BayError::conflict(format!(
                    "cargo {id} is referenced by {} active sandbox(es)",
                    blocking.len()
                ))
                .with_details(serde_json::json!({ "active_sandbox_ids": blocking })));
            }
        }

        self.delete_backing(&cargo).await?;
        self.store.delete_cargo(id).await?;
        info!(cargo_id = %id, owner, "cargo deleted");
        Ok(())
    }

    /// GC path: no owner check, missing row is success.
    pub async fn delete_internal_by_id(&self, id: &str) -> Result<()> {
        let Some(cargo) = self.store.get_cargo(id).await? else {
            return Ok(());
        };
        self.delete_backing(&cargo).await?;
        self.store.delete_cargo(id).await?;
        Ok(())
    }

    /// Volume first, row second: a failed volume delete must keep the row
    /// visible rather than leak the volume. An already-missing volume is
    /// fine.
    async fn delete_backing(&self, cargo: &CargoRecord) -> Result<()> {
        match self.driver.delete_volume(&cargo.driver_ref).await {
            Ok(()) | Err(DriverError::NotFound(_)) => Ok(()),
            Err(err) => Err(driver_to_platform(err)),
        }
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        self.store.touch_cargo(id, now_ms()).await
    }
}

fn driver_to_platform(err: DriverError) -> BayError {
    match err {
        DriverError::NotFound(what) => BayError::not_found(what),
        DriverError::Conflict(what) => BayError::conflict(what),
        DriverError::Timeout(what) => BayError::timeout(what),
        DriverError::Other(err) => BayError::internal(format!("driver: {err:#}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bay_common::ErrorCode;
    use bay_driver::testing::MemoryDriver;

    use super::*;
    use crate::model::SandboxRecord;

    async fn manager() -> (CargoManager, Arc<Store>, Arc<MemoryDriver>) {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let driver = Arc::new(MemoryDriver::new("http://127.0.0.1:1"));
        let manager = CargoManager::new(
            Arc::clone(&store),
            driver.clone(),
            LabelSchema::new("bay"),
            CargoConfig::default(),
        );
        (manager, store, driver)
    }

    fn sandbox_row(id: &str, cargo_id: &str) -> SandboxRecord {
        SandboxRecord {
            id: id.into(),
            owner: "o".into(),
            profile_id: "python-default".into(),
            cargo_id: cargo_id.into(),
            current_session_id: None,
            created_at: now_ms(),
            expires_at: None,
            idle_expires_at: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn create_allocates_volume_and_row() {
        let (manager, _, driver) = manager().await;
        let cargo = manager.create("o", false, None, Some(512)).await.unwrap();
        assert!(!cargo.managed);
        assert_eq!(cargo.size_limit_mb, Some(512));
        assert_eq!(driver.volume_count(), 1);
        assert!(cargo.driver_ref.starts_with("bay-cg-"));

        let fetched = manager.get(&cargo.id, "o").await.unwrap();
        assert_eq!(fetched.driver_ref, cargo.driver_ref);
    }

    #[tokio::test]
    async fn get_hides_foreign_owner_as_not_found() {
        let (manager, _, _) = manager().await;
        let cargo = manager.create("alice", false, None, None).await.unwrap();
        let err = manager.get(&cargo.id, "bob").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn external_delete_blocked_by_active_sandboxes() {
        let (manager, store, driver) = manager().await;
        let cargo = manager.create("o", false, None, None).await.unwrap();
        store
            .insert_sandbox(&sandbox_row("sb_1", &cargo.id))
            .await
            .unwrap();

        let err = manager.delete(&cargo.id, "o", false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(
            err.details().unwrap()["active_sandbox_ids"],
            serde_json::json!(["sb_1"])
        );
        assert_eq!(driver.volume_count(), 1);

        // Soft-deleting the sandbox unblocks deletion.
        store.mark_sandbox_deleted("sb_1", now_ms()).await.unwrap();
        manager.delete(&cargo.id, "o", false).await.unwrap();
        assert_eq!(driver.volume_count(), 0);
    }

    #[tokio::test]
    async fn managed_delete_requires_force_while_owner_lives() {
        let (manager, store, _) = manager().await;
        let cargo = manager
            .create("o", true, Some("sb_1"), None)
            .await
            .unwrap();
        store
            .insert_sandbox(&sandbox_row("sb_1", &cargo.id))
            .await
            .unwrap();

        let err = manager.delete(&cargo.id, "o", false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        // Cascade path.
        manager.delete(&cargo.id, "o", true).await.unwrap();
    }

    #[tokio::test]
    async fn managed_orphan_deletes_without_force() {
        let (manager, store, _) = manager().await;
        let cargo = manager
            .create("o", true, Some("sb_dead"), None)
            .await
            .unwrap();
        store
            .insert_sandbox(&sandbox_row("sb_dead", &cargo.id))
            .await
            .unwrap();
        store
            .mark_sandbox_deleted("sb_dead", now_ms())
            .await
            .unwrap();

        manager.delete(&cargo.id, "o", false).await.unwrap();
    }

    #[tokio::test]
    async fn internal_delete_is_idempotent() {
        let (manager, _, _) = manager().await;
        let cargo = manager.create("o", true, Some("sb_x"), None).await.unwrap();
        manager.delete_internal_by_id(&cargo.id).await.unwrap();
        // Second pass: row and volume both gone, still success.
        manager.delete_internal_by_id(&cargo.id).await.unwrap();
    }
}
