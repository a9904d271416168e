//! The platform error union.
//!
//! Every component raises `BayError`; the gateway owns the single mapping to
//! the canonical `{error: {code, message, details, request_id}}` JSON shape.
//! Library error types (sqlx, bollard, kube, reqwest) never cross a crate
//! boundary — they are wrapped here first.

use serde_json::Value;

/// Stable error codes, one per user-visible failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    FileNotFound,
    Unauthorized,
    Forbidden,
    Validation,
    InvalidPath,
    CapabilityNotSupported,
    Conflict,
    SandboxExpired,
    TtlInfinite,
    IdempotencyConflict,
    SessionNotReady,
    Locked,
    Timeout,
    Ship,
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::FileNotFound => "file_not_found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Validation => "validation_error",
            ErrorCode::InvalidPath => "invalid_path",
            ErrorCode::CapabilityNotSupported => "capability_not_supported",
            ErrorCode::Conflict => "conflict",
            ErrorCode::SandboxExpired => "sandbox_expired",
            ErrorCode::TtlInfinite => "sandbox_ttl_infinite",
            ErrorCode::IdempotencyConflict => "idempotency_conflict",
            ErrorCode::SessionNotReady => "session_not_ready",
            ErrorCode::Locked => "locked",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Ship => "ship_error",
            ErrorCode::Internal => "internal_error",
        }
    }

    /// HTTP status the gateway renders for this code.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::NotFound | ErrorCode::FileNotFound => 404,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::Validation
            | ErrorCode::InvalidPath
            | ErrorCode::CapabilityNotSupported => 400,
            ErrorCode::Conflict
            | ErrorCode::SandboxExpired
            | ErrorCode::TtlInfinite
            | ErrorCode::IdempotencyConflict => 409,
            ErrorCode::SessionNotReady => 503,
            ErrorCode::Locked => 423,
            ErrorCode::Timeout => 504,
            ErrorCode::Ship => 502,
            ErrorCode::Internal => 500,
        }
    }
}

/// Platform error: code + human message + optional structured details.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BayError {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

pub type Result<T, E = BayError> = std::result::Result<T, E>;

impl BayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach a structured details payload (rendered under `error.details`).
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn file_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FileNotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn invalid_path(message: impl Into<String>, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidPath, message)
            .with_details(serde_json::json!({ "reason": reason }))
    }

    pub fn capability_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapabilityNotSupported, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn sandbox_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SandboxExpired, message)
    }

    pub fn ttl_infinite(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TtlInfinite, message)
    }

    pub fn idempotency_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IdempotencyConflict, message)
    }

    pub fn session_not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionNotReady, message)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Locked, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn ship(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Ship, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl From<anyhow::Error> for BayError {
    fn from(err: anyhow::Error) -> Self {
        // anyhow chains come from driver/infra internals; surface the full
        // context chain but keep the code generic.
        BayError::internal(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for BayError {
    fn from(err: serde_json::Error) -> Self {
        BayError::internal(format!("json: {err}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn code_to_status_table() {
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::Unauthorized.http_status(), 401);
        assert_eq!(ErrorCode::InvalidPath.http_status(), 400);
        assert_eq!(ErrorCode::SandboxExpired.http_status(), 409);
        assert_eq!(ErrorCode::IdempotencyConflict.http_status(), 409);
        assert_eq!(ErrorCode::SessionNotReady.http_status(), 503);
        assert_eq!(ErrorCode::Locked.http_status(), 423);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::Ship.http_status(), 502);
    }

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(ErrorCode::TtlInfinite.as_str(), "sandbox_ttl_infinite");
        assert_eq!(ErrorCode::Ship.as_str(), "ship_error");
        assert_eq!(ErrorCode::Validation.as_str(), "validation_error");
    }

    #[test]
    fn details_round_trip() {
        let err = BayError::conflict("cargo in use")
            .with_details(serde_json::json!({ "active_sandbox_ids": ["sb_1"] }));
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(
            err.details().unwrap()["active_sandbox_ids"][0],
            "sb_1"
        );
    }

    #[test]
    fn invalid_path_carries_reason() {
        let err = BayError::invalid_path("path escapes workspace", "path_traversal");
        assert_eq!(err.details().unwrap()["reason"], "path_traversal");
        assert_eq!(err.http_status(), 400);
    }
}
