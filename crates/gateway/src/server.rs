//! Router assembly and server startup.

use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::{Router, middleware};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth;
use crate::request_id;
use crate::routes::{admin, capabilities, cargos, sandboxes};
use crate::state::AppState;

/// Uploads dominate body size; everything else is small JSON.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the full router (shared between production startup and tests).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/sandboxes", post(sandboxes::create).get(sandboxes::list))
        .route(
            "/sandboxes/{id}",
            get(sandboxes::get).delete(sandboxes::delete),
        )
        .route("/sandboxes/{id}/extend_ttl", post(sandboxes::extend_ttl))
        .route("/sandboxes/{id}/keepalive", post(sandboxes::keepalive))
        .route("/sandboxes/{id}/stop", post(sandboxes::stop))
        .route("/sandboxes/{id}/python/exec", post(capabilities::python_exec))
        .route("/sandboxes/{id}/shell/exec", post(capabilities::shell_exec))
        .route("/sandboxes/{id}/browser/exec", post(capabilities::browser_exec))
        .route(
            "/sandboxes/{id}/browser/exec_batch",
            post(capabilities::browser_exec_batch),
        )
        .route(
            "/sandboxes/{id}/filesystem/files",
            get(capabilities::fs_read)
                .put(capabilities::fs_write)
                .delete(capabilities::fs_delete),
        )
        .route(
            "/sandboxes/{id}/filesystem/directories",
            get(capabilities::fs_list),
        )
        .route("/sandboxes/{id}/filesystem/upload", post(capabilities::fs_upload))
        .route(
            "/sandboxes/{id}/filesystem/download",
            get(capabilities::fs_download),
        )
        .route("/cargos", post(cargos::create).get(cargos::list))
        .route("/cargos/{id}", get(cargos::get).delete(cargos::delete))
        .route("/admin/gc/run", post(admin::gc_run))
        .route("/admin/gc/status", get(admin::gc_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", api)
        .layer(middleware::from_fn(request_id::middleware))
        .layer(cors)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn start(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr =
        format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    // Startup banner.
    let lines = [
        format!("bay v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on {local}"),
        format!(
            "driver {}, {} profile(s)",
            state.driver_kind,
            state.config.profiles.len()
        ),
        if state.config.gc.enabled {
            format!("gc every {}s", state.config.gc.interval_seconds)
        } else {
            "gc disabled".to_string()
        },
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let app = build_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "driver": state.driver_kind,
    }))
}
