//! The single error-to-HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bay_common::BayError;

/// Snapshot of a platform error, attached to the response so the
/// request-id middleware can stamp the final body.
#[derive(Debug, Clone)]
pub struct ErrorSnapshot {
    pub code: &'static str,
    pub message: String,
    pub details: serde_json::Value,
    pub status: StatusCode,
}

impl ErrorSnapshot {
    pub fn body(&self, request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
                "request_id": request_id,
            }
        })
    }
}

pub struct ApiError(pub BayError);

impl From<BayError> for ApiError {
    fn from(err: BayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let snapshot = ErrorSnapshot {
            code: self.0.code().as_str(),
            message: self.0.message().to_string(),
            details: self.0.details().cloned().unwrap_or(serde_json::Value::Null),
            status: StatusCode::from_u16(self.0.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        // Render a body without the request id; the middleware rewrites it
        // with the id attached. Direct handler tests still get valid JSON.
        let mut response = (snapshot.status, Json(snapshot.body("unknown"))).into_response();
        response.extensions_mut().insert(snapshot);
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_renders_canonical_shape() {
        let err = BayError::conflict("cargo in use")
            .with_details(serde_json::json!({ "active_sandbox_ids": ["sb_1"] }));
        let response = ApiError(err).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let snapshot = response.extensions().get::<ErrorSnapshot>().unwrap();
        let body = snapshot.body("req_x");
        assert_eq!(body["error"]["code"], "conflict");
        assert_eq!(body["error"]["request_id"], "req_x");
        assert_eq!(body["error"]["details"]["active_sandbox_ids"][0], "sb_1");
    }
}
