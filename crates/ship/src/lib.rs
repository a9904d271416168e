//! Runtime adapter ("ship" client).
//!
//! A thin typed HTTP client bound to one runtime container endpoint. The
//! control plane only ever talks capabilities; this crate owns the mapping
//! from capability methods to the runtime's actual endpoints, the cached
//! `/meta` handshake, and the error translation into platform errors.

mod cache;
mod client;
mod types;

pub use {
    cache::ShipCache,
    client::ShipClient,
    types::{
        BrowserBatchRequest, BrowserExecRequest, CodeExecRequest, DirEntry, ExecOutcome,
        HealthStatus, RuntimeMeta, ShellExecRequest, ShellOutcome,
    },
};
