//! Control-plane core: data model, persistence, per-sandbox concurrency,
//! idempotency, and the managers that drive sandbox/session/cargo
//! lifecycles plus capability routing.

mod cargo_manager;
mod idempotency;
mod locks;
mod model;
mod router;
mod sandbox_manager;
mod session_manager;
mod store;

pub use {
    cargo_manager::CargoManager,
    idempotency::{CacheOutcome, IdempotencyService},
    locks::SandboxLocks,
    model::{
        CargoRecord, ContainerInfo, ExecutionRecord, SandboxRecord, SandboxStatus, SessionRecord,
        SessionStatus,
    },
    router::{CapabilityRouter, ExecutionInfo, Outcome},
    sandbox_manager::SandboxManager,
    session_manager::SessionManager,
    store::Store,
};
