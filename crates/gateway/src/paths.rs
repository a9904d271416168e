//! Workspace path validation at the API boundary.
//!
//! The runtime does its own chroot-style resolution; this validator is
//! defense in depth and fast-fail UX. Paths are parsed as POSIX, `.` and
//! `..` collapse, and nothing may escape the mount root at any prefix.

use bay_common::{BayError, Result};

/// Normalize a client-supplied workspace path or reject it.
///
/// Accepted paths are relative, contain no null bytes, and never traverse
/// above the workspace root. The returned string is the collapsed form
/// (`a/b/../c.txt` becomes `a/c.txt`).
pub fn validate_workspace_path(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(BayError::invalid_path("path must not be empty", "empty_path"));
    }
    if raw.contains('\0') {
        return Err(BayError::invalid_path(
            "path must not contain null bytes",
            "null_byte",
        ));
    }
    if raw.starts_with('/') || raw.starts_with('\\') || has_windows_drive(raw) {
        return Err(BayError::invalid_path(
            "path must be relative to the workspace",
            "absolute_path",
        ));
    }

    let mut stack: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(BayError::invalid_path(
                        format!("path {raw:?} escapes the workspace"),
                        "path_traversal",
                    ));
                }
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        return Err(BayError::invalid_path(
            format!("path {raw:?} resolves to the workspace root"),
            "empty_path",
        ));
    }
    Ok(stack.join("/"))
}

fn has_windows_drive(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}
