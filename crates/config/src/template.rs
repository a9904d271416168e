//! Documented default configuration, printed by `bay config template`.

/// Render the annotated default config. `port` is preserved so regenerating
/// the template does not move a running deployment.
pub fn default_config_template(port: u16) -> String {
    format!(
        r##"# Bay control-plane configuration.
# Env overrides: BAY_SERVER_HOST, BAY_SERVER_PORT, BAY_DATABASE_URL,
# BAY_API_KEY, BAY_INSTANCE_ID. BAY_CONFIG points at this file.

[server]
host = "127.0.0.1"
port = {port}

[database]
# Any sqlx SQLite URL. mode=rwc creates the file on first start.
url = "sqlite://bay.db?mode=rwc"

[driver]
# "local" (Docker engine) or "cluster" (Kubernetes).
type = "local"
label_prefix = "bay"
# local engine: "host_port" publishes runtime ports to ephemeral host ports;
# "container_ip" talks to container IPs directly.
network_mode = "host_port"
host_address = "127.0.0.1"
# cluster scheduler:
namespace = "default"
# storage_class = "standard"
start_timeout_seconds = 120

[cargo]
default_size_limit_mb = 2048
mount_path = "/workspace"

[security]
# Shared bearer key; leave empty only with allow_anonymous = true (dev).
api_key = ""
allow_anonymous = false

[idempotency]
ttl_seconds = 3600

[gc]
enabled = true
run_on_startup = false
interval_seconds = 60
# Safety fence: orphan-container GC only ever touches containers carrying
# this instance id.
instance_id = "bay-default"

[gc.tasks.idle_session]
enabled = true
[gc.tasks.expired_sandbox]
enabled = true
[gc.tasks.orphan_cargo]
enabled = true
[gc.tasks.orphan_container]
enabled = false

[[profiles]]
id = "python-default"
description = "Python code runtime with shell and filesystem access"
idle_timeout = 600

[[profiles.containers]]
name = "main"
image = "shipyard/python-runtime:latest"
runtime_type = "code"
runtime_port = 8000
capabilities = ["code", "shell", "filesystem"]

[profiles.containers.resources]
memory_mb = 1024
cpus = 1.0

[[profiles]]
id = "python-browser"
description = "Python runtime plus a browser runtime sharing the workspace"
idle_timeout = 600

[[profiles.containers]]
name = "main"
image = "shipyard/python-runtime:latest"
runtime_type = "code"
runtime_port = 8000
capabilities = ["code", "shell", "filesystem"]

[[profiles.containers]]
name = "browser"
image = "shipyard/browser-runtime:latest"
runtime_type = "browser"
runtime_port = 8001
capabilities = ["browser"]
primary_for = ["browser"]
"##
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_back_into_config() {
        let rendered = default_config_template(7180);
        let parsed: crate::BayConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 7180);
        assert_eq!(parsed.profiles.len(), 2);
        assert_eq!(parsed.profiles[1].containers.len(), 2);
    }
}
