//! Idempotency for resource-creating writes.
//!
//! Keyed by `(owner, key)`. A replay with the same request fingerprint
//! returns the saved response verbatim; a replay with a different body is a
//! conflict. Expired rows are deleted lazily on the next check.

use std::sync::Arc;
use std::time::Duration;

use bay_common::{BayError, Result, now_ms};
use sha2::{Digest as _, Sha256};
use tracing::debug;

use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Miss,
    /// Saved response to replay verbatim.
    Hit {
        status: u16,
        body: serde_json::Value,
    },
}

pub struct IdempotencyService {
    store: Arc<Store>,
    ttl: Duration,
}

impl IdempotencyService {
    pub fn new(store: Arc<Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Stable request fingerprint: method, path, and the canonicalized body.
    pub fn fingerprint(method: &str, path: &str, body: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonicalize(body).as_bytes());
        hex(hasher.finalize().as_slice())
    }

    pub async fn check(
        &self,
        owner: &str,
        key: &str,
        method: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<CacheOutcome> {
        let Some((saved_method, saved_path, saved_hash, status, response, expires_at)) =
            self.store.get_idempotency(owner, key).await?
        else {
            return Ok(CacheOutcome::Miss);
        };

        if expires_at < now_ms() {
            self.store.delete_idempotency(owner, key).await?;
            return Ok(CacheOutcome::Miss);
        }

        let hash = Self::fingerprint(method, path, body);
        if saved_method == method && saved_path == path && saved_hash == hash {
            debug!(key, "idempotency replay");
            let body: serde_json::Value = serde_json::from_str(&response)?;
            return Ok(CacheOutcome::Hit {
                status: status as u16,
                body,
            });
        }
        Err(BayError::idempotency_conflict(format!(
            "idempotency key {key:?} was already used for a different request"
        )))
    }

    pub async fn save(
        &self,
        owner: &str,
        key: &str,
        method: &str,
        path: &str,
        body: &serde_json::Value,
        status: u16,
        response: &serde_json::Value,
    ) -> Result<()> {
        let now = now_ms();
        self.store
            .upsert_idempotency(
                owner,
                key,
                method,
                path,
                &Self::fingerprint(method, path, body),
                i64::from(status),
                &serde_json::to_string(response)?,
                now,
                now + self.ttl.as_millis() as i64,
            )
            .await
    }
}

/// Render JSON with object keys sorted recursively, so field order in the
/// client's body never changes the fingerprint.
fn canonicalize(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
