//! Capability endpoints, scoped under a sandbox.
//!
//! Each handler applies the static capability gate (cheap, avoids cold
//! starts for operations the profile can never serve), validates workspace
//! paths, and hands the actual call to the router. Runtime-level failures
//! (user code raising, non-zero exits) are 200s with `success=false`.

use axum::Json;
use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use bay_common::{BayError, Capability};
use bay_ship::{BrowserBatchRequest, BrowserExecRequest, CodeExecRequest, ShellExecRequest};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::Identity;
use crate::error::ApiResult;
use crate::paths::validate_workspace_path;
use crate::state::AppState;

const DEFAULT_EXEC_TIMEOUT: u64 = 30;
const DEFAULT_BATCH_TIMEOUT: u64 = 60;

fn default_exec_timeout() -> u64 {
    DEFAULT_EXEC_TIMEOUT
}

fn default_batch_timeout() -> u64 {
    DEFAULT_BATCH_TIMEOUT
}

/// Static gate: the profile must declare the capability before any compute
/// is provisioned for the call.
async fn gate(
    state: &AppState,
    owner: &str,
    sandbox_id: &str,
    capability: Capability,
) -> Result<(), BayError> {
    let (record, _) = state.sandboxes.get(sandbox_id, owner).await?;
    let profile = state
        .config
        .profile(&record.profile_id)
        .ok_or_else(|| BayError::internal(format!("unknown profile {:?}", record.profile_id)))?;
    if !profile.supports(capability) {
        return Err(BayError::capability_not_supported(format!(
            "profile {:?} does not provide the {capability} capability",
            profile.id
        )));
    }
    Ok(())
}

fn call_metadata(description: Option<&str>, tags: Option<&[String]>) -> Option<Value> {
    if description.is_none() && tags.is_none() {
        return None;
    }
    Some(json!({ "description": description, "tags": tags }))
}

// ── Code and shell ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PythonExecRequest {
    pub code: String,
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

pub async fn python_exec(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(body): Json<PythonExecRequest>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Code).await?;
    let metadata = call_metadata(body.description.as_deref(), body.tags.as_deref());
    let request = CodeExecRequest {
        code: body.code,
        timeout: body.timeout,
    };
    let (outcome, info) = state
        .router
        .invoke(&id, &identity.owner, Capability::Code, "python", metadata, |client| async move {
            client.exec_code(&request).await
        })
        .await?;
    Ok(Json(json!({
        "success": outcome.success,
        "output": outcome.output,
        "error": outcome.error,
        "data": outcome.data,
        "execution_id": info.execution_id,
        "execution_time_ms": info.execution_time_ms,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ShellExecBody {
    pub command: String,
    pub cwd: Option<String>,
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
}

pub async fn shell_exec(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(body): Json<ShellExecBody>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Shell).await?;
    let cwd = body
        .cwd
        .as_deref()
        .map(validate_workspace_path)
        .transpose()?;
    let request = ShellExecRequest {
        command: body.command,
        cwd,
        timeout: body.timeout,
    };
    let (outcome, info) = state
        .router
        .invoke(&id, &identity.owner, Capability::Shell, "shell", None, |client| async move {
            client.exec_shell(&request).await
        })
        .await?;
    Ok(Json(json!({
        "success": outcome.success,
        "output": outcome.output,
        "error": outcome.error,
        "exit_code": outcome.exit_code,
        "execution_id": info.execution_id,
        "execution_time_ms": info.execution_time_ms,
    })))
}

// ── Browser ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BrowserExecBody {
    pub cmd: Value,
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
}

pub async fn browser_exec(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(body): Json<BrowserExecBody>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Browser).await?;
    let request = BrowserExecRequest {
        cmd: body.cmd,
        timeout: body.timeout,
    };
    let (result, info) = state
        .router
        .invoke(&id, &identity.owner, Capability::Browser, "browser", None, |client| async move {
            client.browser_exec(&request).await
        })
        .await?;
    Ok(Json(json!({
        "result": result,
        "execution_id": info.execution_id,
        "execution_time_ms": info.execution_time_ms,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BrowserBatchBody {
    pub commands: Vec<Value>,
    #[serde(default = "default_batch_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub stop_on_error: bool,
}

pub async fn browser_exec_batch(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(body): Json<BrowserBatchBody>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Browser).await?;
    let request = BrowserBatchRequest {
        commands: body.commands,
        timeout: body.timeout,
        stop_on_error: body.stop_on_error,
    };
    let (result, info) = state
        .router
        .invoke(
            &id,
            &identity.owner,
            Capability::Browser,
            "browser_batch",
            None,
            |client| async move { client.browser_exec_batch(&request).await },
        )
        .await?;
    Ok(Json(json!({
        "result": result,
        "execution_id": info.execution_id,
        "execution_time_ms": info.execution_time_ms,
    })))
}

// ── Filesystem ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FsQuery {
    pub path: String,
}

pub async fn fs_read(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Query(query): Query<FsQuery>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Filesystem).await?;
    let path = validate_workspace_path(&query.path)?;
    let read_path = path.clone();
    let (content, info) = state
        .router
        .invoke(&id, &identity.owner, Capability::Filesystem, "fs_read", None, |client| async move {
            client.read_file(&read_path).await
        })
        .await?;
    Ok(Json(json!({
        "path": path,
        "content": content,
        "execution_id": info.execution_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct FsWriteBody {
    pub content: String,
}

pub async fn fs_write(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Query(query): Query<FsQuery>,
    Json(body): Json<FsWriteBody>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Filesystem).await?;
    let path = validate_workspace_path(&query.path)?;
    let write_path = path.clone();
    let (_, info) = state
        .router
        .invoke(&id, &identity.owner, Capability::Filesystem, "fs_write", None, |client| async move {
            client.write_file(&write_path, &body.content).await
        })
        .await?;
    Ok(Json(json!({
        "path": path,
        "status": "ok",
        "execution_id": info.execution_id,
    })))
}

pub async fn fs_delete(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Query(query): Query<FsQuery>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Filesystem).await?;
    let path = validate_workspace_path(&query.path)?;
    let delete_path = path.clone();
    let (_, info) = state
        .router
        .invoke(
            &id,
            &identity.owner,
            Capability::Filesystem,
            "fs_delete",
            None,
            |client| async move { client.delete_file(&delete_path).await },
        )
        .await?;
    Ok(Json(json!({
        "path": path,
        "status": "deleted",
        "execution_id": info.execution_id,
    })))
}

pub async fn fs_list(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Query(query): Query<FsQuery>,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Filesystem).await?;
    let path = validate_workspace_path(&query.path)?;
    let list_path = path.clone();
    let (entries, info) = state
        .router
        .invoke(&id, &identity.owner, Capability::Filesystem, "fs_list", None, |client| async move {
            client.list_dir(&list_path).await
        })
        .await?;
    Ok(Json(json!({
        "path": path,
        "entries": entries,
        "execution_id": info.execution_id,
    })))
}

pub async fn fs_upload(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    gate(&state, &identity.owner, &id, Capability::Filesystem).await?;

    let mut file: Option<(String, bytes::Bytes)> = None;
    let mut target: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BayError::validation(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| BayError::validation(format!("unreadable file part: {e}")))?;
                file = Some((filename, data));
            }
            Some("path") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| BayError::validation(format!("unreadable path part: {e}")))?;
                target = Some(value);
            }
            _ => {}
        }
    }
    let (filename, data) = file.ok_or_else(|| BayError::validation("missing \"file\" part"))?;
    let target = target.ok_or_else(|| BayError::validation("missing \"path\" part"))?;
    let path = validate_workspace_path(&target)?;

    let upload_path = path.clone();
    let size = data.len();
    let (_, info) = state
        .router
        .invoke(&id, &identity.owner, Capability::Filesystem, "upload", None, |client| async move {
            client.upload(&upload_path, &filename, data).await
        })
        .await?;
    Ok(Json(json!({
        "path": path,
        "size": size,
        "status": "ok",
        "execution_id": info.execution_id,
    })))
}

pub async fn fs_download(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Query(query): Query<FsQuery>,
) -> ApiResult<impl IntoResponse> {
    gate(&state, &identity.owner, &id, Capability::Filesystem).await?;
    let path = validate_workspace_path(&query.path)?;
    let download_path = path.clone();
    let (data, _) = state
        .router
        .invoke(
            &id,
            &identity.owner,
            Capability::Filesystem,
            "download",
            None,
            |client| async move { client.download(&download_path).await },
        )
        .await?;

    let filename = path.rsplit('/').next().unwrap_or("download.bin").to_string();
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        data,
    ))
}
