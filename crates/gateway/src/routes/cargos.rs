//! External cargo endpoints. Managed cargos are created and destroyed by
//! their sandbox; only external ones are managed here.

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use bay_common::{BayError, to_rfc3339};
use bay_core::CargoRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::auth::Identity;
use crate::error::ApiResult;
use crate::routes::{idempotency_key, idempotent, page_params};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCargoRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<u64>,
    pub managed: Option<bool>,
}

fn cargo_view(cargo: &CargoRecord) -> Value {
    json!({
        "id": cargo.id,
        "managed": cargo.managed,
        "managed_by_sandbox_id": cargo.managed_by_sandbox_id,
        "backend": cargo.backend,
        "size_limit_mb": cargo.size_limit_mb,
        "created_at": to_rfc3339(cargo.created_at),
        "last_accessed_at": to_rfc3339(cargo.last_accessed_at),
    })
}

pub async fn create(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    Json(body): Json<CreateCargoRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = idempotency_key(&headers);
    let body_value = serde_json::to_value(&body).map_err(BayError::from)?;
    idempotent(
        &state,
        &identity.owner,
        key,
        "POST",
        "/v1/cargos",
        &body_value,
        || async {
            let cargo = state
                .cargos
                .create(&identity.owner, false, None, body.size_limit_mb)
                .await?;
            Ok((StatusCode::CREATED, cargo_view(&cargo)))
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
        .cargos
        .list(&identity.owner, query.managed, offset, limit)
        .await?;
    Ok(Json(json!({
        "items": page.items.iter().map(cargo_view).collect::<Vec<_>>(),
        "next_cursor": page.next_cursor,
    })))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let cargo = state.cargos.get(&id, &identity.owner).await?;
    Ok(Json(cargo_view(&cargo)))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.cargos.delete(&id, &identity.owner, false).await?;
    Ok(StatusCode::NO_CONTENT)
}
