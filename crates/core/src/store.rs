//! SQLite persistence.
//!
//! All queries are runtime-bound (no compile-time query metadata); rows map
//! via `FromRow` or explicit extraction. Timestamps are epoch milliseconds.

use bay_common::{BayError, Result};
use sqlx::Row as _;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::model::{
    CargoRecord, ContainerInfo, ExecutionRecord, SandboxRecord, SessionRecord, SessionStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sandboxes (
    id                 TEXT PRIMARY KEY,
    owner              TEXT NOT NULL,
    profile_id         TEXT NOT NULL,
    cargo_id           TEXT NOT NULL,
    current_session_id TEXT,
    created_at         INTEGER NOT NULL,
    expires_at         INTEGER,
    idle_expires_at    INTEGER,
    deleted_at         INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sandboxes_owner ON sandboxes(owner, created_at);
CREATE INDEX IF NOT EXISTS idx_sandboxes_idle ON sandboxes(idle_expires_at) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sandboxes_expiry ON sandboxes(expires_at) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sandboxes_cargo ON sandboxes(cargo_id);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    sandbox_id TEXT NOT NULL,
    profile_id TEXT NOT NULL,
    status     TEXT NOT NULL,
    containers TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cargos (
    id                     TEXT PRIMARY KEY,
    owner                  TEXT NOT NULL,
    managed                INTEGER NOT NULL,
    managed_by_sandbox_id  TEXT,
    backend                TEXT NOT NULL,
    driver_ref             TEXT NOT NULL,
    size_limit_mb          INTEGER,
    created_at             INTEGER NOT NULL,
    last_accessed_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cargos_owner ON cargos(owner, created_at);

CREATE TABLE IF NOT EXISTS idempotency_records (
    owner         TEXT NOT NULL,
    key           TEXT NOT NULL,
    method        TEXT NOT NULL,
    path          TEXT NOT NULL,
    request_hash  TEXT NOT NULL,
    status_code   INTEGER NOT NULL,
    response_json TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    expires_at    INTEGER NOT NULL,
    PRIMARY KEY (owner, key)
);

CREATE TABLE IF NOT EXISTS executions (
    id          TEXT PRIMARY KEY,
    sandbox_id  TEXT NOT NULL,
    session_id  TEXT NOT NULL,
    exec_type   TEXT NOT NULL,
    started_at  INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    success     INTEGER NOT NULL,
    metadata    TEXT
);
CREATE INDEX IF NOT EXISTS idx_executions_sandbox ON executions(sandbox_id, started_at);
"#;

fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> BayError + '_ {
    move |e| BayError::internal(format!("db {context}: {e}"))
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        // In-memory databases are per-connection; a pool larger than one
        // would hand out empty databases.
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_err("connect"))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err("schema init"))?;
        Ok(())
    }

    // ── Sandboxes ────────────────────────────────────────────────────────

    pub async fn insert_sandbox(&self, sandbox: &SandboxRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sandboxes \
             (id, owner, profile_id, cargo_id, current_session_id, created_at, expires_at, \
              idle_expires_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&sandbox.id)
        .bind(&sandbox.owner)
        .bind(&sandbox.profile_id)
        .bind(&sandbox.cargo_id)
        .bind(&sandbox.current_session_id)
        .bind(sandbox.created_at)
        .bind(sandbox.expires_at)
        .bind(sandbox.idle_expires_at)
        .bind(sandbox.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert sandbox"))?;
        Ok(())
    }

    /// Raw fetch, including soft-deleted rows. Internal use only.
    pub async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxRecord>> {
        sqlx::query_as::<_, SandboxRecord>("SELECT * FROM sandboxes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get sandbox"))
    }

    /// Owner-scoped fetch; soft-deleted rows and foreign owners both read
    /// as absent, so the API cannot leak existence across owners.
    pub async fn get_sandbox_for_owner(
        &self,
        id: &str,
        owner: &str,
    ) -> Result<Option<SandboxRecord>> {
        sqlx::query_as::<_, SandboxRecord>(
            "SELECT * FROM sandboxes WHERE id = ? AND owner = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get sandbox"))
    }

    pub async fn list_sandboxes(
        &self,
        owner: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<SandboxRecord>> {
        sqlx::query_as::<_, SandboxRecord>(
            "SELECT * FROM sandboxes WHERE owner = ? AND deleted_at IS NULL \
             ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(owner)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list sandboxes"))
    }

    pub async fn update_sandbox_session(
        &self,
        id: &str,
        session_id: Option<&str>,
        idle_expires_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET current_session_id = ?, idle_expires_at = ? WHERE id = ?")
            .bind(session_id)
            .bind(idle_expires_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update sandbox session"))?;
        Ok(())
    }

    pub async fn update_sandbox_idle(&self, id: &str, idle_expires_at: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET idle_expires_at = ? WHERE id = ?")
            .bind(idle_expires_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update sandbox idle"))?;
        Ok(())
    }

    /// Monotonicity is also guarded here: the row never moves backwards even
    /// if two extends race past the keyed lock.
    pub async fn update_sandbox_expiry(&self, id: &str, expires_at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sandboxes SET expires_at = MAX(COALESCE(expires_at, 0), ?) WHERE id = ?",
        )
        .bind(expires_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err("update sandbox expiry"))?;
        Ok(())
    }

    pub async fn mark_sandbox_deleted(&self, id: &str, now_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sandboxes SET deleted_at = ?, current_session_id = NULL, \
             idle_expires_at = NULL WHERE id = ?",
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err("mark sandbox deleted"))?;
        Ok(())
    }

    pub async fn sandboxes_with_idle_expired(&self, now_ms: i64) -> Result<Vec<SandboxRecord>> {
        sqlx::query_as::<_, SandboxRecord>(
            "SELECT * FROM sandboxes WHERE deleted_at IS NULL \
             AND idle_expires_at IS NOT NULL AND idle_expires_at < ?",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("select idle-expired"))
    }

    pub async fn sandboxes_with_ttl_expired(&self, now_ms: i64) -> Result<Vec<SandboxRecord>> {
        sqlx::query_as::<_, SandboxRecord>(
            "SELECT * FROM sandboxes WHERE deleted_at IS NULL \
             AND expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("select ttl-expired"))
    }

    /// Non-deleted sandboxes referencing a cargo; these block external
    /// cargo deletion.
    pub async fn sandboxes_referencing_cargo(&self, cargo_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM sandboxes WHERE cargo_id = ? AND deleted_at IS NULL ORDER BY id",
        )
        .bind(cargo_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("select cargo references"))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(db_err("read id")))
            .collect()
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
        let status_raw: String = row.try_get("status").map_err(db_err("read session"))?;
        let containers_raw: String = row.try_get("containers").map_err(db_err("read session"))?;
        let containers: Vec<ContainerInfo> = serde_json::from_str(&containers_raw)?;
        Ok(SessionRecord {
            id: row.try_get("id").map_err(db_err("read session"))?,
            sandbox_id: row.try_get("sandbox_id").map_err(db_err("read session"))?,
            profile_id: row.try_get("profile_id").map_err(db_err("read session"))?,
            status: SessionStatus::parse(&status_raw)
                .ok_or_else(|| BayError::internal(format!("bad session status {status_raw:?}")))?,
            containers,
            created_at: row.try_get("created_at").map_err(db_err("read session"))?,
        })
    }

    pub async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, sandbox_id, profile_id, status, containers, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.sandbox_id)
        .bind(&session.profile_id)
        .bind(session.status.as_str())
        .bind(serde_json::to_string(&session.containers)?)
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert session"))?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get session"))?;
        row.as_ref().map(Self::session_from_row).transpose()
    }

    pub async fn session_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("session exists"))?;
        Ok(row.is_some())
    }

    pub async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update session status"))?;
        Ok(())
    }

    pub async fn update_session_ready(
        &self,
        id: &str,
        containers: &[ContainerInfo],
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'ready', containers = ? WHERE id = ?")
            .bind(serde_json::to_string(containers)?)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update session ready"))?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete session"))?;
        Ok(())
    }

    // ── Cargos ───────────────────────────────────────────────────────────

    pub async fn insert_cargo(&self, cargo: &CargoRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO cargos \
             (id, owner, managed, managed_by_sandbox_id, backend, driver_ref, size_limit_mb, \
              created_at, last_accessed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cargo.id)
        .bind(&cargo.owner)
        .bind(cargo.managed)
        .bind(&cargo.managed_by_sandbox_id)
        .bind(&cargo.backend)
        .bind(&cargo.driver_ref)
        .bind(cargo.size_limit_mb)
        .bind(cargo.created_at)
        .bind(cargo.last_accessed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert cargo"))?;
        Ok(())
    }

    pub async fn get_cargo(&self, id: &str) -> Result<Option<CargoRecord>> {
        sqlx::query_as::<_, CargoRecord>("SELECT * FROM cargos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get cargo"))
    }

    pub async fn get_cargo_for_owner(&self, id: &str, owner: &str) -> Result<Option<CargoRecord>> {
        sqlx::query_as::<_, CargoRecord>("SELECT * FROM cargos WHERE id = ? AND owner = ?")
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get cargo"))
    }

    pub async fn list_cargos(
        &self,
        owner: &str,
        managed_filter: Option<bool>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CargoRecord>> {
        match managed_filter {
            Some(managed) => sqlx::query_as::<_, CargoRecord>(
                "SELECT * FROM cargos WHERE owner = ? AND managed = ? \
                 ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            )
            .bind(owner)
            .bind(managed)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list cargos")),
            None => sqlx::query_as::<_, CargoRecord>(
                "SELECT * FROM cargos WHERE owner = ? \
                 ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            )
            .bind(owner)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list cargos")),
        }
    }

    pub async fn touch_cargo(&self, id: &str, now_ms: i64) -> Result<()> {
        sqlx::query("UPDATE cargos SET last_accessed_at = ? WHERE id = ?")
            .bind(now_ms)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("touch cargo"))?;
        Ok(())
    }

    pub async fn delete_cargo(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cargos WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete cargo"))?;
        Ok(())
    }

    /// Managed cargos whose owning sandbox is gone or soft-deleted.
    pub async fn orphan_managed_cargos(&self) -> Result<Vec<CargoRecord>> {
        sqlx::query_as::<_, CargoRecord>(
            "SELECT c.* FROM cargos c \
             LEFT JOIN sandboxes s ON s.id = c.managed_by_sandbox_id \
             WHERE c.managed = 1 AND (s.id IS NULL OR s.deleted_at IS NOT NULL)",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("select orphan cargos"))
    }

    // ── Idempotency ──────────────────────────────────────────────────────

    pub async fn get_idempotency(
        &self,
        owner: &str,
        key: &str,
    ) -> Result<Option<(String, String, String, i64, String, i64)>> {
        let row = sqlx::query(
            "SELECT method, path, request_hash, status_code, response_json, expires_at \
             FROM idempotency_records WHERE owner = ? AND key = ?",
        )
        .bind(owner)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get idempotency"))?;
        row.map(|row| {
            Ok((
                row.try_get("method").map_err(db_err("read idempotency"))?,
                row.try_get("path").map_err(db_err("read idempotency"))?,
                row.try_get("request_hash")
                    .map_err(db_err("read idempotency"))?,
                row.try_get("status_code")
                    .map_err(db_err("read idempotency"))?,
                row.try_get("response_json")
                    .map_err(db_err("read idempotency"))?,
                row.try_get("expires_at")
                    .map_err(db_err("read idempotency"))?,
            ))
        })
        .transpose()
    }

    pub async fn upsert_idempotency(
        &self,
        owner: &str,
        key: &str,
        method: &str,
        path: &str,
        request_hash: &str,
        status_code: i64,
        response_json: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO idempotency_records \
             (owner, key, method, path, request_hash, status_code, response_json, created_at, \
              expires_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(owner)
        .bind(key)
        .bind(method)
        .bind(path)
        .bind(request_hash)
        .bind(status_code)
        .bind(response_json)
        .bind(created_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert idempotency"))?;
        Ok(())
    }

    pub async fn delete_idempotency(&self, owner: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM idempotency_records WHERE owner = ? AND key = ?")
            .bind(owner)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete idempotency"))?;
        Ok(())
    }

    // ── Executions ───────────────────────────────────────────────────────

    pub async fn insert_execution(&self, execution: &ExecutionRecord) -> Result<()> {
        let metadata = execution
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO executions \
             (id, sandbox_id, session_id, exec_type, started_at, duration_ms, success, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.sandbox_id)
        .bind(&execution.session_id)
        .bind(&execution.exec_type)
        .bind(execution.started_at)
        .bind(execution.duration_ms)
        .bind(execution.success)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert execution"))?;
        Ok(())
    }
}
