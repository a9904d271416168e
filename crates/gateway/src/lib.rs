//! HTTP API for the Bay control plane.
//!
//! One axum router: authentication, request-id propagation, workspace path
//! validation, the static capability gate, idempotent writes, and the
//! canonical error shape all live here. Everything below this crate speaks
//! `BayError`; this crate is the only place errors become HTTP.

pub mod auth;
pub mod error;
pub mod paths;
pub mod request_id;
pub mod routes;
pub mod server;
pub mod state;

pub use {
    server::{build_app, start},
    state::AppState,
};
