//! Prefixed opaque identifiers.
//!
//! Ids are `<prefix>_<uuid-simple>`; the prefix makes log lines and DB rows
//! self-describing without parsing.

use uuid::Uuid;

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

pub fn sandbox_id() -> String {
    new_id("sb")
}

pub fn session_id() -> String {
    new_id("sess")
}

pub fn cargo_id() -> String {
    new_id("cg")
}

pub fn execution_id() -> String {
    new_id("exec")
}

pub fn request_id() -> String {
    new_id("req")
}
