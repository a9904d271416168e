//! Shared application state and component wiring.

use std::sync::Arc;
use std::time::Duration;

use bay_config::BayConfig;
use bay_core::{
    CapabilityRouter, CargoManager, IdempotencyService, SandboxLocks, SandboxManager,
    SessionManager, Store,
};
use bay_driver::{Driver, LabelSchema};
use bay_gc::{GcContext, GcScheduler, SingleReplica};
use bay_ship::ShipCache;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BayConfig>,
    pub store: Arc<Store>,
    pub sandboxes: Arc<SandboxManager>,
    pub cargos: Arc<CargoManager>,
    pub router: Arc<CapabilityRouter>,
    pub idempotency: Arc<IdempotencyService>,
    pub gc: Arc<GcScheduler>,
    pub driver_kind: &'static str,
}

/// Wire every component onto one store and driver.
pub fn build_state(config: Arc<BayConfig>, store: Arc<Store>, driver: Arc<dyn Driver>) -> AppState {
    let schema = LabelSchema::new(&config.driver.label_prefix);
    let locks = Arc::new(SandboxLocks::new());
    let ships = Arc::new(ShipCache::new());

    let cargos = Arc::new(CargoManager::new(
        Arc::clone(&store),
        Arc::clone(&driver),
        schema.clone(),
        config.cargo.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&driver),
        Arc::clone(&ships),
        schema.clone(),
        config.gc.instance_id.clone(),
        Duration::from_secs(config.driver.start_timeout_seconds),
    ));
    let sandboxes = Arc::new(SandboxManager::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&cargos),
        Arc::clone(&sessions),
        Arc::clone(&locks),
    ));
    let router = Arc::new(CapabilityRouter::new(
        Arc::clone(&store),
        Arc::clone(&sandboxes),
        Arc::clone(&sessions),
        Arc::clone(&ships),
        Arc::clone(&locks),
    ));
    let idempotency = Arc::new(IdempotencyService::new(
        Arc::clone(&store),
        Duration::from_secs(config.idempotency.ttl_seconds),
    ));
    let gc = Arc::new(GcScheduler::new(
        GcContext {
            store: Arc::clone(&store),
            driver: Arc::clone(&driver),
            sandboxes: Arc::clone(&sandboxes),
            sessions: Arc::clone(&sessions),
            cargos: Arc::clone(&cargos),
            locks,
            schema,
            instance_id: config.gc.instance_id.clone(),
        },
        config.gc.clone(),
        Arc::new(SingleReplica),
    ));

    AppState {
        driver_kind: driver.kind(),
        config,
        store,
        sandboxes,
        cargos,
        router,
        idempotency,
        gc,
    }
}
