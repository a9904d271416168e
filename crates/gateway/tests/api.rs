//! End-to-end API tests against an in-process control plane.
//!
//! A fake runtime server stands in for the code/browser containers and an
//! in-memory driver stands in for the container engine, so these exercise
//! the full path: auth, idempotency, routing, lazy provisioning, GC.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use bay_common::now_ms;
use bay_config::BayConfig;
use bay_core::Store;
use bay_driver::RuntimeInstance;
use bay_driver::testing::MemoryDriver;
use bay_gateway::{build_app, state::build_state};
use serde_json::{Value, json};

const API_KEY: &str = "test-key";

// ── Fake runtime ─────────────────────────────────────────────────────────

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

async fn runtime_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn runtime_meta() -> Json<Value> {
    Json(json!({
        "runtime": { "name": "fake-runtime", "version": "0.0.1", "api_version": "v1" },
        "workspace": { "mount_path": "/workspace" },
        "capabilities": { "code": {}, "shell": {}, "filesystem": {}, "browser": {} },
    }))
}

async fn runtime_exec_code(Json(body): Json<Value>) -> Json<Value> {
    let code = body["code"].as_str().unwrap_or_default();
    let output = if code == "print(1+2)" { "3\n" } else { "" };
    Json(json!({ "success": true, "output": output, "error": null, "data": null }))
}

async fn runtime_exec_shell(Json(body): Json<Value>) -> Json<Value> {
    let command = body["command"].as_str().unwrap_or_default();
    Json(json!({
        "success": true,
        "output": format!("ran: {command}\n"),
        "error": null,
        "exit_code": 0,
    }))
}

async fn runtime_fs_read(
    State(files): State<Files>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let path = query.get("path").cloned().unwrap_or_default();
    match files.lock().unwrap().get(&path) {
        Some(content) => (
            StatusCode::OK,
            Json(json!({ "content": String::from_utf8_lossy(content) })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such file" })),
        ),
    }
}

async fn runtime_fs_write(State(files): State<Files>, Json(body): Json<Value>) -> Json<Value> {
    let path = body["path"].as_str().unwrap_or_default().to_string();
    let content = body["content"].as_str().unwrap_or_default().to_string();
    files.lock().unwrap().insert(path, content.into_bytes());
    Json(json!({ "status": "ok" }))
}

async fn runtime_fs_delete(
    State(files): State<Files>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let path = query.get("path").cloned().unwrap_or_default();
    match files.lock().unwrap().remove(&path) {
        Some(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such file" })),
        ),
    }
}

async fn runtime_fs_dir(
    State(files): State<Files>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let prefix = query.get("path").cloned().unwrap_or_default();
    let entries: Vec<Value> = files
        .lock()
        .unwrap()
        .iter()
        .filter(|(path, _)| path.starts_with(&prefix))
        .map(|(path, content)| json!({ "name": path, "is_dir": false, "size": content.len() }))
        .collect();
    Json(json!({ "entries": entries }))
}

async fn runtime_upload(
    State(files): State<Files>,
    mut multipart: axum::extract::Multipart,
) -> Json<Value> {
    let mut data = Vec::new();
    let mut path = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        match field.name() {
            Some("file") => data = field.bytes().await.unwrap().to_vec(),
            Some("path") => path = field.text().await.unwrap(),
            _ => {}
        }
    }
    files.lock().unwrap().insert(path, data);
    Json(json!({ "status": "ok" }))
}

async fn runtime_download(
    State(files): State<Files>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let path = query.get("path").cloned().unwrap_or_default();
    match files.lock().unwrap().get(&path) {
        Some(content) => (StatusCode::OK, content.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "no such file" }))).into_response(),
    }
}

async fn runtime_browser_exec(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "ok": true, "echo": body["cmd"] }))
}

async fn start_fake_runtime() -> (SocketAddr, Files) {
    let files: Files = Arc::new(Mutex::new(HashMap::new()));
    let app = axum::Router::new()
        .route("/health", get(runtime_health))
        .route("/meta", get(runtime_meta))
        .route("/ipython/exec", post(runtime_exec_code))
        .route("/shell/exec", post(runtime_exec_shell))
        .route(
            "/fs/file",
            get(runtime_fs_read)
                .put(runtime_fs_write)
                .delete(runtime_fs_delete),
        )
        .route("/fs/dir", get(runtime_fs_dir))
        .route("/upload", post(runtime_upload))
        .route("/download", get(runtime_download))
        .route("/exec", post(runtime_browser_exec))
        .route("/exec_batch", post(runtime_browser_exec))
        .with_state(Arc::clone(&files));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, files)
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    base: String,
    client: reqwest::Client,
    store: Arc<Store>,
    driver: Arc<MemoryDriver>,
    _tmp: tempfile::TempDir,
}

async fn harness() -> Harness {
    let (runtime_addr, _files) = start_fake_runtime().await;

    let mut config = BayConfig::default();
    config.security.api_key = API_KEY.into();
    config.gc.instance_id = "it".into();
    config.gc.tasks.orphan_container.enabled = true;
    let config = Arc::new(config);

    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("bay.db");
    let store = Arc::new(
        Store::connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .unwrap(),
    );
    let driver = Arc::new(MemoryDriver::new(format!("http://{runtime_addr}")));

    let state = build_state(
        Arc::clone(&config),
        Arc::clone(&store),
        driver.clone() as Arc<dyn bay_driver::Driver>,
    );
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::AUTHORIZATION,
        format!("Bearer {API_KEY}").parse().unwrap(),
    );
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .unwrap();

    Harness {
        base: format!("http://{addr}"),
        client,
        store,
        driver,
        _tmp: tmp,
    }
}

impl Harness {
    async fn create_sandbox(&self, body: Value) -> Value {
        let response = self
            .client
            .post(format!("{}/v1/sandboxes", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201, "{}", response.text().await.unwrap());
        response.json().await.unwrap()
    }

    async fn exec_python(&self, sandbox_id: &str, code: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}/v1/sandboxes/{sandbox_id}/python/exec", self.base))
            .json(&json!({ "code": code, "timeout": 10 }))
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        (status, response.json().await.unwrap())
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_needs_no_auth() {
    let h = harness().await;
    let response = reqwest::get(format!("{}/health", h.base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["driver"], "memory");
}

#[tokio::test]
async fn bad_key_is_rejected_with_request_id() {
    let h = harness().await;
    let response = reqwest::Client::new()
        .get(format!("{}/v1/sandboxes", h.base))
        .header("Authorization", "Bearer wrong")
        .header("X-Request-Id", "req_client_chosen")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req_client_chosen"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
    assert_eq!(body["error"]["request_id"], "req_client_chosen");
}

#[tokio::test]
async fn lazy_provisioning_starts_compute_on_first_exec() {
    let h = harness().await;
    let sandbox = h
        .create_sandbox(json!({ "profile": "python-default", "ttl": 3600 }))
        .await;
    assert_eq!(sandbox["status"], "idle");
    assert_eq!(h.driver.container_count(), 0);

    let id = sandbox["id"].as_str().unwrap();
    let (status, body) = h.exec_python(id, "print(1+2)").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["output"], "3\n");
    assert!(body["execution_id"].as_str().unwrap().starts_with("exec_"));

    // Exactly one container, carrying the platform label set.
    assert_eq!(h.driver.container_count(), 1);
    let containers = h.driver.containers_with_label("bay.sandbox_id", id);
    assert_eq!(containers.len(), 1);
    assert_eq!(
        containers[0].labels.get("bay.managed").map(String::as_str),
        Some("true")
    );
    assert_eq!(
        containers[0].labels.get("bay.instance_id").map(String::as_str),
        Some("it")
    );

    let response = h
        .client
        .get(format!("{}/v1/sandboxes/{id}", h.base))
        .send()
        .await
        .unwrap();
    let view: Value = response.json().await.unwrap();
    assert_eq!(view["status"], "ready");
}

#[tokio::test]
async fn path_traversal_is_rejected_and_dotdot_normalizes() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({})).await;
    let id = sandbox["id"].as_str().unwrap();

    let response = h
        .client
        .get(format!(
            "{}/v1/sandboxes/{id}/filesystem/files?path=../../etc/passwd",
            h.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_path");
    assert_eq!(body["error"]["details"]["reason"], "path_traversal");
    // Rejected before any compute was provisioned.
    assert_eq!(h.driver.container_count(), 0);

    // `a/b/../c.txt` collapses to `a/c.txt` and goes through.
    let response = h
        .client
        .put(format!(
            "{}/v1/sandboxes/{id}/filesystem/files?path=a/b/../c.txt",
            h.base
        ))
        .json(&json!({ "content": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["path"], "a/c.txt");

    let response = h
        .client
        .get(format!(
            "{}/v1/sandboxes/{id}/filesystem/files?path=a/c.txt",
            h.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["content"], "hello");
}

#[tokio::test]
async fn missing_file_maps_to_file_not_found() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({})).await;
    let id = sandbox["id"].as_str().unwrap();

    let response = h
        .client
        .get(format!(
            "{}/v1/sandboxes/{id}/filesystem/files?path=nope.txt",
            h.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "file_not_found");
}

#[tokio::test]
async fn capability_gate_rejects_before_provisioning() {
    let h = harness().await;
    let sandbox = h
        .create_sandbox(json!({ "profile": "python-default" }))
        .await;
    let id = sandbox["id"].as_str().unwrap();

    let response = h
        .client
        .post(format!("{}/v1/sandboxes/{id}/browser/exec", h.base))
        .json(&json!({ "cmd": { "op": "goto" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "capability_not_supported");
    assert_eq!(h.driver.container_count(), 0);
}

#[tokio::test]
async fn browser_routes_to_the_browser_container() {
    let h = harness().await;
    let sandbox = h
        .create_sandbox(json!({ "profile": "python-browser" }))
        .await;
    let id = sandbox["id"].as_str().unwrap();

    let response = h
        .client
        .post(format!("{}/v1/sandboxes/{id}/browser/exec", h.base))
        .json(&json!({ "cmd": { "op": "goto", "url": "https://example.com" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["ok"], true);
    // Both profile containers were provisioned together.
    assert_eq!(h.driver.container_count(), 2);
}

#[tokio::test]
async fn expired_sandbox_rejects_extend_ttl() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({ "ttl": 1 })).await;
    let id = sandbox["id"].as_str().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    let response = h
        .client
        .post(format!("{}/v1/sandboxes/{id}/extend_ttl", h.base))
        .json(&json!({ "extend_by": 600 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "sandbox_expired");
}

#[tokio::test]
async fn extend_ttl_replays_byte_identical_under_one_key() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({ "ttl": 60 })).await;
    let id = sandbox["id"].as_str().unwrap();
    let url = format!("{}/v1/sandboxes/{id}/extend_ttl", h.base);

    let first = h
        .client
        .post(&url)
        .header("Idempotency-Key", "ext-1")
        .json(&json!({ "extend_by": 600 }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let first: Value = first.json().await.unwrap();

    let replay = h
        .client
        .post(&url)
        .header("Idempotency-Key", "ext-1")
        .json(&json!({ "extend_by": 600 }))
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 200);
    let replay: Value = replay.json().await.unwrap();
    assert_eq!(first["expires_at"], replay["expires_at"]);

    // Same key, different body: conflict.
    let conflict = h
        .client
        .post(&url)
        .header("Idempotency-Key", "ext-1")
        .json(&json!({ "extend_by": 601 }))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);
    let body: Value = conflict.json().await.unwrap();
    assert_eq!(body["error"]["code"], "idempotency_conflict");
}

#[tokio::test]
async fn sandbox_create_is_idempotent_under_one_key() {
    let h = harness().await;
    let body = json!({ "profile": "python-default", "ttl": 3600 });

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = h
            .client
            .post(format!("{}/v1/sandboxes", h.base))
            .header("Idempotency-Key", "create-1")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let view: Value = response.json().await.unwrap();
        ids.push(view["id"].as_str().unwrap().to_string());
    }
    assert_eq!(ids[0], ids[1]);

    // Only one sandbox (and one managed cargo) actually exists.
    assert_eq!(h.driver.volume_count(), 1);
}

#[tokio::test]
async fn idle_reclaim_then_auto_resume_on_next_exec() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({})).await;
    let id = sandbox["id"].as_str().unwrap();

    h.exec_python(id, "1").await;
    assert_eq!(h.driver.container_count(), 1);
    let first_container = h.driver.containers_with_label("bay.sandbox_id", id)[0]
        .id
        .clone();

    // Simulate the idle timeout elapsing.
    h.store
        .update_sandbox_idle(id, Some(now_ms() - 1_000))
        .await
        .unwrap();

    let response = h
        .client
        .post(format!("{}/v1/admin/gc/run", h.base))
        .json(&json!({ "tasks": ["idle_session"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["cleaned"], 1);
    assert_eq!(h.driver.container_count(), 0);

    let view: Value = h
        .client
        .get(format!("{}/v1/sandboxes/{id}", h.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["status"], "idle");

    // The next call reprovisions a different session/container.
    let (status, body) = h.exec_python(id, "1").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    let second_container = h.driver.containers_with_label("bay.sandbox_id", id)[0]
        .id
        .clone();
    assert_ne!(first_container, second_container);
}

#[tokio::test]
async fn external_cargo_delete_blocked_while_referenced() {
    let h = harness().await;
    let cargo: Value = h
        .client
        .post(format!("{}/v1/cargos", h.base))
        .json(&json!({ "size_limit_mb": 512 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let cargo_id = cargo["id"].as_str().unwrap();
    assert_eq!(cargo["managed"], false);

    let sandbox = h.create_sandbox(json!({ "cargo_id": cargo_id })).await;
    let sandbox_id = sandbox["id"].as_str().unwrap();

    let response = h
        .client
        .delete(format!("{}/v1/cargos/{cargo_id}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "conflict");
    assert_eq!(
        body["error"]["details"]["active_sandbox_ids"],
        json!([sandbox_id])
    );

    let response = h
        .client
        .delete(format!("{}/v1/sandboxes/{sandbox_id}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = h
        .client
        .delete(format!("{}/v1/cargos/{cargo_id}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn stop_releases_compute_preserves_files_and_resumes() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({})).await;
    let id = sandbox["id"].as_str().unwrap();

    h.client
        .put(format!(
            "{}/v1/sandboxes/{id}/filesystem/files?path=keep.txt",
            h.base
        ))
        .json(&json!({ "content": "survives stop" }))
        .send()
        .await
        .unwrap();
    assert_eq!(h.driver.container_count(), 1);

    // Stop twice: both succeed.
    for _ in 0..2 {
        let response = h
            .client
            .post(format!("{}/v1/sandboxes/{id}/stop", h.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(h.driver.container_count(), 0);
    assert_eq!(h.driver.volume_count(), 1);

    // Next filesystem call reprovisions and the file is still there.
    let response = h
        .client
        .get(format!(
            "{}/v1/sandboxes/{id}/filesystem/files?path=keep.txt",
            h.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["content"], "survives stop");
    assert_eq!(h.driver.container_count(), 1);
}

#[tokio::test]
async fn delete_removes_everything_and_hides_behind_404() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({})).await;
    let id = sandbox["id"].as_str().unwrap();
    h.exec_python(id, "1").await;

    let response = h
        .client
        .delete(format!("{}/v1/sandboxes/{id}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert_eq!(h.driver.container_count(), 0);
    assert_eq!(h.driver.volume_count(), 0);
    assert!(h.driver.containers_with_label("bay.sandbox_id", id).is_empty());

    let response = h
        .client
        .get(format!("{}/v1/sandboxes/{id}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn upload_download_round_trip_is_binary_safe() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({})).await;
    let id = sandbox["id"].as_str().unwrap();

    let payload: Vec<u8> = (0u16..512).map(|i| (i % 251) as u8).collect();
    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(payload.clone()).file_name("data.bin"),
        )
        .text("path", "blob/data.bin");
    let response = h
        .client
        .post(format!("{}/v1/sandboxes/{id}/filesystem/upload", h.base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "{}", response.text().await.unwrap());

    let response = h
        .client
        .get(format!(
            "{}/v1/sandboxes/{id}/filesystem/download?path=blob/data.bin",
            h.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/octet-stream"
    );
    let downloaded = response.bytes().await.unwrap();
    assert_eq!(downloaded.as_ref(), payload.as_slice());
}

#[tokio::test]
async fn orphan_container_gc_honors_the_trust_fence() {
    let h = harness().await;

    let full_labels = |instance: &str, session: &str| -> HashMap<String, String> {
        HashMap::from([
            ("bay.managed".into(), "true".into()),
            ("bay.owner".into(), "default".into()),
            ("bay.sandbox_id".into(), "sb_x".into()),
            ("bay.session_id".into(), session.into()),
            ("bay.cargo_id".into(), "cg_x".into()),
            ("bay.profile_id".into(), "python-default".into()),
            ("bay.instance_id".into(), instance.into()),
        ])
    };

    // Foreign instance id: never touched.
    h.driver.inject_instance(RuntimeInstance {
        id: "foreign".into(),
        name: "bay-session-xyz".into(),
        labels: full_labels("other", "sess_foreign"),
        state: "running".into(),
    });
    // Ours, but the session does not exist: destroyed.
    h.driver.inject_instance(RuntimeInstance {
        id: "stale".into(),
        name: "bay-session-stale".into(),
        labels: full_labels("it", "sess_fake"),
        state: "running".into(),
    });

    let response = h
        .client
        .post(format!("{}/v1/admin/gc/run", h.base))
        .json(&json!({ "tasks": ["orphan_container"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["cleaned"], 1);

    assert!(h.driver.instance_present("foreign"));
    assert!(!h.driver.instance_present("stale"));
}

#[tokio::test]
async fn gc_status_reports_config_and_last_run() {
    let h = harness().await;
    let status: Value = h
        .client
        .get(format!("{}/v1/admin/gc/status", h.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["enabled"], true);
    assert_eq!(status["instance_id"], "it");
    assert_eq!(status["running"], false);
    assert!(status["last_run"].is_null());

    h.client
        .post(format!("{}/v1/admin/gc/run", h.base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    let status: Value = h
        .client
        .get(format!("{}/v1/admin/gc/status", h.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["last_run"]["at"].is_number());
}

#[tokio::test]
async fn keepalive_defers_idle_reclaim() {
    let h = harness().await;
    let sandbox = h.create_sandbox(json!({})).await;
    let id = sandbox["id"].as_str().unwrap();
    h.exec_python(id, "1").await;

    // Idle clock in the past, but keepalive resets it before GC runs.
    h.store
        .update_sandbox_idle(id, Some(now_ms() - 1_000))
        .await
        .unwrap();
    let response = h
        .client
        .post(format!("{}/v1/sandboxes/{id}/keepalive", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = h
        .client
        .post(format!("{}/v1/admin/gc/run", h.base))
        .json(&json!({ "tasks": ["idle_session"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cleaned"], 0);
    assert_eq!(h.driver.container_count(), 1);
}
