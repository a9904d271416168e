//! Admin endpoints: manual GC trigger and status.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GcRunRequest {
    /// Restrict the cycle to these tasks; omitted runs every enabled task.
    pub tasks: Option<Vec<String>>,
}

pub async fn gc_run(
    State(state): State<AppState>,
    body: Option<Json<GcRunRequest>>,
) -> ApiResult<Json<Value>> {
    let tasks = body.and_then(|Json(body)| body.tasks);
    let reports = state.gc.run_once(tasks.as_deref()).await?;
    let cleaned: u64 = reports.iter().map(|r| r.cleaned).sum();
    Ok(Json(json!({
        "results": reports,
        "cleaned": cleaned,
    })))
}

pub async fn gc_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let config = state.gc.config();
    Ok(Json(json!({
        "enabled": config.enabled,
        "run_on_startup": config.run_on_startup,
        "interval_seconds": config.interval_seconds,
        "instance_id": config.instance_id,
        "tasks": {
            "idle_session": config.tasks.idle_session.enabled,
            "expired_sandbox": config.tasks.expired_sandbox.enabled,
            "orphan_cargo": config.tasks.orphan_cargo.enabled,
            "orphan_container": config.tasks.orphan_container.enabled,
        },
        "running": state.gc.is_running(),
        "last_run": state.gc.last_run().await,
    })))
}
