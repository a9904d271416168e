//! Shared primitives for the Bay control plane: the platform error union,
//! id generation, time helpers, and pagination cursors.

mod capability;
mod error;
mod id;
mod page;
mod time;

pub use {
    capability::Capability,
    error::{BayError, ErrorCode, Result},
    id::{cargo_id, execution_id, new_id, request_id, sandbox_id, session_id},
    page::{Page, decode_cursor, encode_cursor},
    time::{from_rfc3339, now_ms, to_rfc3339},
};
