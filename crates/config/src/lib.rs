//! Static configuration for the Bay control plane.
//!
//! A single TOML file plus a small set of `BAY_*` environment overrides.
//! Profiles are normalized at load time (legacy single-image shape becomes a
//! one-element container list), so everything downstream only ever sees the
//! multi-container form.

mod profile;
pub mod template;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use profile::{ContainerSpec, Profile, ResourceSpec, RuntimeType, StartupConfig, StartupOrder};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BayConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub driver: DriverConfig,
    pub cargo: CargoConfig,
    pub security: SecurityConfig,
    pub idempotency: IdempotencyConfig,
    pub gc: GcConfig,
    pub profiles: Vec<Profile>,
}

impl Default for BayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            driver: DriverConfig::default(),
            cargo: CargoConfig::default(),
            security: SecurityConfig::default(),
            idempotency: IdempotencyConfig::default(),
            gc: GcConfig::default(),
            profiles: profile::default_profiles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://bay.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum DriverKind {
    #[default]
    Local,
    Cluster,
}

/// How the local engine exposes a runtime container to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum NetworkMode {
    /// Publish the runtime port to an ephemeral host port.
    #[default]
    HostPort,
    /// Talk to the container-network IP directly (control plane shares the
    /// container network).
    ContainerIp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    #[serde(rename = "type")]
    pub kind: DriverKind,
    /// Prefix applied to every platform label key.
    pub label_prefix: String,
    /// Local engine only.
    pub network_mode: NetworkMode,
    pub host_address: String,
    /// Cluster scheduler only.
    pub namespace: String,
    pub storage_class: Option<String>,
    /// Upper bound on container start + readiness, in seconds.
    pub start_timeout_seconds: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Local,
            label_prefix: "bay".into(),
            network_mode: NetworkMode::HostPort,
            host_address: "127.0.0.1".into(),
            namespace: "default".into(),
            storage_class: None,
            start_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CargoConfig {
    pub default_size_limit_mb: u64,
    /// Where every cargo volume is mounted inside runtime containers.
    pub mount_path: String,
}

impl Default for CargoConfig {
    fn default() -> Self {
        Self {
            default_size_limit_mb: 2048,
            mount_path: "/workspace".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared bearer key. Empty + `allow_anonymous = false` fails validation.
    pub api_key: String,
    /// Dev only: accept an `X-Bay-Owner` header instead of a key.
    pub allow_anonymous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_seconds: 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GcTaskToggle {
    pub enabled: bool,
}

impl GcTaskToggle {
    fn on() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcTasksConfig {
    pub idle_session: GcTaskToggle,
    pub expired_sandbox: GcTaskToggle,
    pub orphan_cargo: GcTaskToggle,
    /// Off by default: destroys containers, so it must be opted into.
    pub orphan_container: GcTaskToggle,
}

impl Default for GcTasksConfig {
    fn default() -> Self {
        Self {
            idle_session: GcTaskToggle::on(),
            expired_sandbox: GcTaskToggle::on(),
            orphan_cargo: GcTaskToggle::on(),
            orphan_container: GcTaskToggle::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    pub run_on_startup: bool,
    pub interval_seconds: u64,
    /// Identifies this deployment; orphan-container GC refuses to touch
    /// containers labeled with a different instance id.
    pub instance_id: String,
    pub tasks: GcTasksConfig,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_on_startup: false,
            interval_seconds: 60,
            instance_id: "bay-default".into(),
            tasks: GcTasksConfig::default(),
        }
    }
}

impl BayConfig {
    /// Load from a TOML file, then apply env overrides and normalize
    /// profiles.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: BayConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.finish()?;
        Ok(config)
    }

    /// `BAY_CONFIG` env var, then `./bay.toml`, then built-in defaults.
    pub fn discover_and_load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("BAY_CONFIG") {
            return Self::load(Path::new(&path));
        }
        let local = Path::new("bay.toml");
        if local.exists() {
            return Self::load(local);
        }
        let mut config = BayConfig::default();
        config.finish()?;
        Ok(config)
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides();
        if self.profiles.is_empty() {
            self.profiles = profile::default_profiles();
        }
        for profile in &mut self.profiles {
            profile.normalize()?;
        }
        self.check()?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("BAY_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("BAY_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }
        if let Ok(url) = std::env::var("BAY_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(key) = std::env::var("BAY_API_KEY") {
            self.security.api_key = key;
        }
        if let Ok(instance) = std::env::var("BAY_INSTANCE_ID") {
            self.gc.instance_id = instance;
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate profile id {:?}",
                    profile.id
                )));
            }
        }
        if self.gc.instance_id.is_empty() {
            return Err(ConfigError::Invalid("gc.instance_id must not be empty".into()));
        }
        Ok(())
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// The profile used when a create request names none.
    pub fn default_profile(&self) -> &Profile {
        // `finish` guarantees at least one profile.
        &self.profiles[0]
    }

    /// Non-fatal misconfiguration advisories, logged once at startup.
    pub fn validation_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.security.allow_anonymous {
            warnings.push(
                "Anonymous mode is enabled. Any client naming an owner header gets full access; \
                 do not expose this instance beyond localhost."
                    .to_string(),
            );
        }
        if self.security.api_key.is_empty() && !self.security.allow_anonymous {
            warnings.push(
                "No api_key configured and anonymous mode is off. Every request will be rejected."
                    .to_string(),
            );
        }
        if !self.gc.enabled {
            warnings.push(
                "Garbage collection is disabled. Idle sessions and expired sandboxes will \
                 accumulate until cleaned manually."
                    .to_string(),
            );
        }
        for profile in &self.profiles {
            if profile.idle_timeout == 0 {
                warnings.push(format!(
                    "Profile {:?} has idle_timeout = 0; sessions will be reclaimed on the next \
                     GC cycle after any call.",
                    profile.id
                ));
            }
        }
        warnings
    }
}
