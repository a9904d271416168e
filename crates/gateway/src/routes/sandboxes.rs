//! Sandbox lifecycle endpoints.

use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bay_common::{BayError, to_rfc3339};
use bay_config::Profile;
use bay_core::{SandboxRecord, SandboxStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::auth::Identity;
use crate::error::ApiResult;
use crate::routes::{idempotency_key, idempotent, page_params};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cargo_id: Option<String>,
    /// Absolute lifetime in seconds; omitted means no TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<u64>,
    pub status: Option<SandboxStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtendTtlRequest {
    pub extend_by: u64,
}

pub(crate) fn sandbox_view(
    record: &SandboxRecord,
    status: SandboxStatus,
    profile: &Profile,
) -> Value {
    json!({
        "id": record.id,
        "status": status,
        "profile": record.profile_id,
        "cargo_id": record.cargo_id,
        "capabilities": profile.capability_set(),
        "created_at": to_rfc3339(record.created_at),
        "expires_at": record.expires_at.map(to_rfc3339),
        "idle_expires_at": record.idle_expires_at.map(to_rfc3339),
    })
}

fn profile_of<'a>(state: &'a AppState, record: &SandboxRecord) -> Result<&'a Profile, BayError> {
    state.config.profile(&record.profile_id).ok_or_else(|| {
        BayError::internal(format!("unknown profile {:?}", record.profile_id))
    })
}

pub async fn create(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    Json(body): Json<CreateSandboxRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = idempotency_key(&headers);
    let body_value = serde_json::to_value(&body).map_err(BayError::from)?;
    idempotent(
        &state,
        &identity.owner,
        key,
        "POST",
        "/v1/sandboxes",
        &body_value,
        || async {
            let (record, profile) = state
                .sandboxes
                .create(
                    &identity.owner,
                    body.profile.as_deref(),
                    body.cargo_id.as_deref(),
                    body.ttl,
                )
                .await?;
            let status = state.sandboxes.status_of(&record).await?;
            Ok((
                StatusCode::CREATED,
                sandbox_view(&record, status, profile),
            ))
        },
    )
    .await
}

pub async fn list(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let (offset, limit) = page_params(query.cursor.as_deref(), query.limit)?;
    let page = state
        .sandboxes
        .list(&identity.owner, query.status, offset, limit)
        .await?;
    let items: Result<Vec<Value>, BayError> = page
        .items
        .iter()
        .map(|(record, status)| {
            profile_of(&state, record).map(|profile| sandbox_view(record, *status, profile))
        })
        .collect();
    Ok(Json(json!({
        "items": items?,
        "next_cursor": page.next_cursor,
    })))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let (record, status) = state.sandboxes.get(&id, &identity.owner).await?;
    let profile = profile_of(&state, &record)?;
    Ok(Json(sandbox_view(&record, status, profile)))
}

pub async fn extend_ttl(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExtendTtlRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = idempotency_key(&headers);
    let body_value = serde_json::to_value(&body).map_err(BayError::from)?;
    let path = format!("/v1/sandboxes/{id}/extend_ttl");
    idempotent(
        &state,
        &identity.owner,
        key,
        "POST",
        &path,
        &body_value,
        || async {
            let record = state
                .sandboxes
                .extend_ttl(&id, &identity.owner, body.extend_by)
                .await?;
            let status = state.sandboxes.status_of(&record).await?;
            let profile = profile_of(&state, &record)?;
            Ok((StatusCode::OK, sandbox_view(&record, status, profile)))
        },
    )
    .await
}

pub async fn keepalive(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.sandboxes.keepalive(&id, &identity.owner).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn stop(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.sandboxes.stop(&id, &identity.owner).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.sandboxes.delete(&id, &identity.owner).await?;
    Ok(StatusCode::NO_CONTENT)
}
