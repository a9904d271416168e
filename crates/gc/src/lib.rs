//! Background garbage collection.
//!
//! One serial cycle runs four tasks in a fixed order: idle sessions,
//! expired sandboxes, orphaned managed cargos, and (opt-in) orphaned
//! containers. Tasks double-check their predicates under the per-sandbox
//! lock, so a racing `keepalive` or `extend_ttl` always wins.

mod scheduler;
mod tasks;

pub use {
    scheduler::{Coordinator, GcScheduler, LastRun, SingleReplica},
    tasks::{GcContext, TaskReport},
};
