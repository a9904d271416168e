//! Request-id propagation.
//!
//! Accepts a client-supplied `X-Request-Id` or generates one, exposes it to
//! handlers via a request extension, stamps it on the response header, and
//! rewrites platform error bodies to include it.

use axum::Json;
use axum::extract::Request;
use axum::http::{HeaderValue, header::HeaderName};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ErrorSnapshot;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(bay_common::request_id);
    request.extensions_mut().insert(RequestId(id.clone()));

    let response = next.run(request).await;

    // Platform errors carry a snapshot; rebuild the body with the id.
    let mut response = match response.extensions().get::<ErrorSnapshot>().cloned() {
        Some(snapshot) => (snapshot.status, Json(snapshot.body(&id))).into_response(),
        None => response,
    };
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}
