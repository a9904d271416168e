//! The adapter itself: one client per runtime container.

use std::time::Duration;

use bay_common::{BayError, Capability, Result};
use bay_config::RuntimeType;
use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::types::{
    BrowserBatchRequest, BrowserExecRequest, CodeExecRequest, DirEntry, ExecOutcome, HealthStatus,
    RuntimeMeta, ShellExecRequest, ShellOutcome,
};

/// Transport buffer on top of the caller's logical timeout: the runtime
/// enforces the logical deadline itself and reports a soft failure; the
/// transport deadline only catches a hung connection.
const TRANSPORT_BUFFER: Duration = Duration::from_secs(5);
const BATCH_TRANSPORT_BUFFER: Duration = Duration::from_secs(10);
/// Deadline for cheap control calls (health, meta, fs ops).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

fn runtime_type_name(rt: RuntimeType) -> &'static str {
    match rt {
        RuntimeType::Code => "code",
        RuntimeType::Browser => "browser",
    }
}

pub struct ShipClient {
    http: reqwest::Client,
    base: Url,
    container_id: String,
    runtime_type: RuntimeType,
    meta: OnceCell<RuntimeMeta>,
}

#[derive(Deserialize)]
struct FileContent {
    content: String,
}

#[derive(Deserialize)]
struct DirListing {
    entries: Vec<DirEntry>,
}

impl ShipClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: &str,
        container_id: &str,
        runtime_type: RuntimeType,
    ) -> Result<Self> {
        let base = Url::parse(endpoint)
            .map_err(|e| BayError::internal(format!("bad runtime endpoint {endpoint:?}: {e}")))?;
        Ok(Self {
            http,
            base,
            container_id: container_id.to_string(),
            runtime_type,
            meta: OnceCell::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        self.base.as_str()
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| BayError::internal(format!("bad runtime path {path:?}: {e}")))
    }

    fn require(&self, expected: RuntimeType, what: &str) -> Result<()> {
        if self.runtime_type == expected {
            Ok(())
        } else {
            Err(BayError::capability_not_supported(format!(
                "{what} is not provided by the {} runtime",
                runtime_type_name(self.runtime_type)
            )))
        }
    }

    fn transport_error(err: reqwest::Error, what: &str) -> BayError {
        if err.is_timeout() {
            BayError::timeout(format!("runtime call {what} exceeded its transport deadline"))
        } else {
            BayError::ship(format!("runtime unreachable during {what}: {err}"))
        }
    }

    /// Map a non-2xx runtime response into the platform error shape,
    /// preserving the upstream JSON body under `details`.
    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BayError::file_not_found(format!("{what}: not found")));
        }
        let details = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        Err(
            BayError::ship(format!("runtime returned {status} during {what}"))
                .with_details(serde_json::json!({ "upstream": details })),
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        let response = self
            .http
            .get(self.url(path)?)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, what))?;
        let response = Self::check(response, what).await?;
        response
            .json()
            .await
            .map_err(|e| BayError::ship(format!("malformed runtime response for {what}: {e}")))
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        let response = self
            .http
            .post(self.url(path)?)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, what))?;
        let response = Self::check(response, what).await?;
        response
            .json()
            .await
            .map_err(|e| BayError::ship(format!("malformed runtime response for {what}: {e}")))
    }

    // ── Handshake ────────────────────────────────────────────────────────

    pub async fn health(&self) -> Result<HealthStatus> {
        self.get_json("/health", &[], CONTROL_TIMEOUT, "health")
            .await
    }

    /// `/meta`, fetched once per adapter instance and cached for the
    /// container's lifetime.
    pub async fn get_meta(&self) -> Result<&RuntimeMeta> {
        self.meta
            .get_or_try_init(|| async {
                let raw: serde_json::Value = self
                    .get_json("/meta", &[], CONTROL_TIMEOUT, "meta")
                    .await?;
                let meta = RuntimeMeta::parse(raw)
                    .map_err(|e| BayError::ship(format!("malformed runtime meta: {e}")))?;
                debug!(
                    container_id = %self.container_id,
                    runtime = %meta.name,
                    version = %meta.version,
                    "cached runtime meta"
                );
                Ok(meta)
            })
            .await
    }

    /// Second-line capability check against what the runtime actually
    /// advertises, after the static profile gate.
    pub async fn verify_capability(&self, capability: Capability) -> Result<()> {
        let meta = self.get_meta().await?;
        if meta.capabilities.contains(&capability) {
            Ok(())
        } else {
            Err(BayError::capability_not_supported(format!(
                "runtime {} does not advertise the {capability} capability",
                meta.name
            )))
        }
    }

    // ── Code runtime ─────────────────────────────────────────────────────

    pub async fn exec_code(&self, request: &CodeExecRequest) -> Result<ExecOutcome> {
        self.require(RuntimeType::Code, "code execution")?;
        let timeout = Duration::from_secs(request.timeout) + TRANSPORT_BUFFER;
        self.post_json("/ipython/exec", request, timeout, "code execution")
            .await
    }

    pub async fn exec_shell(&self, request: &ShellExecRequest) -> Result<ShellOutcome> {
        self.require(RuntimeType::Code, "shell execution")?;
        let timeout = Duration::from_secs(request.timeout) + TRANSPORT_BUFFER;
        self.post_json("/shell/exec", request, timeout, "shell execution")
            .await
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.require(RuntimeType::Code, "file read")?;
        let body: FileContent = self
            .get_json("/fs/file", &[("path", path)], CONTROL_TIMEOUT, "file read")
            .await?;
        Ok(body.content)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.require(RuntimeType::Code, "file write")?;
        let response = self
            .http
            .put(self.url("/fs/file")?)
            .json(&serde_json::json!({ "path": path, "content": content }))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, "file write"))?;
        Self::check(response, "file write").await?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.require(RuntimeType::Code, "file delete")?;
        let response = self
            .http
            .delete(self.url("/fs/file")?)
            .query(&[("path", path)])
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, "file delete"))?;
        Self::check(response, "file delete").await?;
        Ok(())
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.require(RuntimeType::Code, "directory listing")?;
        let body: DirListing = self
            .get_json(
                "/fs/dir",
                &[("path", path)],
                CONTROL_TIMEOUT,
                "directory listing",
            )
            .await?;
        Ok(body.entries)
    }

    pub async fn upload(&self, path: &str, filename: &str, data: Bytes) -> Result<()> {
        self.require(RuntimeType::Code, "file upload")?;
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("path", path.to_string());
        let response = self
            .http
            .post(self.url("/upload")?)
            .multipart(form)
            .timeout(CONTROL_TIMEOUT + TRANSPORT_BUFFER)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, "file upload"))?;
        Self::check(response, "file upload").await?;
        Ok(())
    }

    pub async fn download(&self, path: &str) -> Result<Bytes> {
        self.require(RuntimeType::Code, "file download")?;
        let response = self
            .http
            .get(self.url("/download")?)
            .query(&[("path", path)])
            .timeout(CONTROL_TIMEOUT + TRANSPORT_BUFFER)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, "file download"))?;
        let response = Self::check(response, "file download").await?;
        response
            .bytes()
            .await
            .map_err(|e| BayError::ship(format!("download stream failed: {e}")))
    }

    // ── Browser runtime ──────────────────────────────────────────────────

    pub async fn browser_exec(&self, request: &BrowserExecRequest) -> Result<serde_json::Value> {
        self.require(RuntimeType::Browser, "browser execution")?;
        let timeout = Duration::from_secs(request.timeout) + TRANSPORT_BUFFER;
        self.post_json("/exec", request, timeout, "browser execution")
            .await
    }

    pub async fn browser_exec_batch(
        &self,
        request: &BrowserBatchRequest,
    ) -> Result<serde_json::Value> {
        self.require(RuntimeType::Browser, "browser batch execution")?;
        let timeout = Duration::from_secs(request.timeout) + BATCH_TRANSPORT_BUFFER;
        self.post_json("/exec_batch", request, timeout, "browser batch execution")
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bay_common::ErrorCode;

    use super::*;

    fn client_for(url: &str, runtime_type: RuntimeType) -> ShipClient {
        ShipClient::new(reqwest::Client::new(), url, "c1", runtime_type).unwrap()
    }

    #[tokio::test]
    async fn meta_is_fetched_once_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/meta")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "runtime": {"name": "python-runtime", "version": "1.0.0", "api_version": "v1"},
                    "workspace": {"mount_path": "/workspace"},
                    "capabilities": {"code": {}, "shell": {}}
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server.url(), RuntimeType::Code);
        let first = client.get_meta().await.unwrap().name.clone();
        let second = client.get_meta().await.unwrap().name.clone();
        assert_eq!(first, "python-runtime");
        assert_eq!(second, "python-runtime");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn runtime_404_maps_to_file_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fs/file")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let client = client_for(&server.url(), RuntimeType::Code);
        let err = client.read_file("missing.txt").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn upstream_error_body_is_preserved_in_details() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ipython/exec")
            .with_status(500)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": "kernel wedged"}"#)
            .create_async()
            .await;

        let client = client_for(&server.url(), RuntimeType::Code);
        let err = client
            .exec_code(&CodeExecRequest {
                code: "1".into(),
                timeout: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Ship);
        assert_eq!(err.details().unwrap()["upstream"]["error"], "kernel wedged");
    }

    #[tokio::test]
    async fn wrong_runtime_type_is_capability_not_supported() {
        let client = client_for("http://127.0.0.1:1", RuntimeType::Browser);
        let err = client
            .exec_code(&CodeExecRequest {
                code: "1".into(),
                timeout: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CapabilityNotSupported);

        let code_client = client_for("http://127.0.0.1:1", RuntimeType::Code);
        let err = code_client
            .browser_exec(&BrowserExecRequest {
                cmd: serde_json::json!({"op": "goto"}),
                timeout: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CapabilityNotSupported);
    }

    #[tokio::test]
    async fn verify_capability_checks_advertised_set() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/meta")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "runtime": {"name": "r", "version": "1", "api_version": "v1"},
                    "workspace": {"mount_path": "/workspace"},
                    "capabilities": {"code": {}}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = client_for(&server.url(), RuntimeType::Code);
        client
            .verify_capability(bay_common::Capability::Code)
            .await
            .unwrap();
        let err = client
            .verify_capability(bay_common::Capability::Browser)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CapabilityNotSupported);
    }
}
