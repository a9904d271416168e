//! Route handlers, grouped by resource.

pub mod admin;
pub mod capabilities;
pub mod cargos;
pub mod sandboxes;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use bay_common::{BayError, decode_cursor};
use serde_json::Value;

use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) const DEFAULT_PAGE_LIMIT: u64 = 50;
pub(crate) const MAX_PAGE_LIMIT: u64 = 200;

pub(crate) fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn page_params(
    cursor: Option<&str>,
    limit: Option<u64>,
) -> Result<(u64, u64), BayError> {
    let offset = match cursor {
        Some(cursor) => decode_cursor(cursor)?,
        None => 0,
    };
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    Ok((offset, limit))
}

/// Run a resource-creating write under an optional `Idempotency-Key`:
/// replay a saved response verbatim, reject key reuse with a different
/// body, and save successful outcomes.
pub(crate) async fn idempotent<F, Fut>(
    state: &AppState,
    owner: &str,
    key: Option<String>,
    method: &str,
    path: &str,
    body: &Value,
    run: F,
) -> ApiResult<(StatusCode, Json<Value>)>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, Value), BayError>>,
{
    if let Some(key) = &key {
        if let bay_core::CacheOutcome::Hit { status, body } = state
            .idempotency
            .check(owner, key, method, path, body)
            .await?
        {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Ok((status, Json(body)));
        }
    }

    let (status, value) = run().await?;

    if let Some(key) = &key
        && status.is_success()
    {
        state
            .idempotency
            .save(owner, key, method, path, body, status.as_u16(), &value)
            .await?;
    }
    Ok((status, Json(value)))
}
