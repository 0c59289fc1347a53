//! Toolkit configuration for `sealward`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `SEALWARD_*` environment variables, and
//! the CLI overrides those again with explicit flags. Nothing here is global:
//! the resulting [`ToolkitConfig`] is threaded into every constructor.

use std::path::PathBuf;
use std::time::Duration;

/// Label selecting the Vault server pods of the official Helm chart.
pub const DEFAULT_LABEL: &str = "app.kubernetes.io/name=vault";

/// Label the Vault service registration puts on the active (leader) replica.
pub const DEFAULT_ACTIVE_LABEL: &str = "vault-active=true";

/// Local port historically used for every tunnel.
pub const DEFAULT_LOCAL_PORT: u16 = 8200;

/// How a tunnel picks its local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPort {
    /// Always bind this port. Concurrent runs on one machine collide.
    Fixed(u16),
    /// Let the OS assign a free port for every tunnel.
    Ephemeral,
}

impl LocalPort {
    /// Port number handed to `bind` (`0` asks the OS for one).
    #[must_use]
    pub fn bind_port(self) -> u16 {
        match self {
            Self::Fixed(port) => port,
            Self::Ephemeral => 0,
        }
    }

    /// Interpret a raw port number, treating `0` as ephemeral.
    #[must_use]
    pub fn from_port(port: u16) -> Self {
        if port == 0 {
            Self::Ephemeral
        } else {
            Self::Fixed(port)
        }
    }
}

impl Default for LocalPort {
    fn default() -> Self {
        Self::Fixed(DEFAULT_LOCAL_PORT)
    }
}

/// URL scheme Vault listens with behind the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VaultScheme {
    #[default]
    Http,
    /// TLS with certificate verification disabled (the tunnel ends on
    /// `127.0.0.1`, which never matches the server certificate).
    Https,
}

impl VaultScheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Toolkit configuration.
#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    /// Root directory of the per-environment credential cache.
    pub cache_dir: PathBuf,
    /// Label selector identifying Vault pods.
    pub label: String,
    /// Label marking the active replica.
    pub active_label: String,
    /// Local port policy for tunnels.
    pub local_port: LocalPort,
    /// Interval between pod phase checks.
    pub pod_poll_interval: Duration,
    /// Maximum time to wait for a pod to reach `Running`.
    pub pod_startup_timeout: Duration,
    /// Maximum time to wait for a tunnel to become ready.
    pub tunnel_ready_timeout: Duration,
    /// Per-request timeout for the Vault HTTP API.
    pub request_timeout: Duration,
    /// Scheme Vault is served with.
    pub vault_scheme: VaultScheme,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            label: DEFAULT_LABEL.to_owned(),
            active_label: DEFAULT_ACTIVE_LABEL.to_owned(),
            local_port: LocalPort::default(),
            pod_poll_interval: Duration::from_millis(500),
            pod_startup_timeout: Duration::from_secs(300),
            tunnel_ready_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            vault_scheme: VaultScheme::Http,
            log_level: "info".to_owned(),
        }
    }
}

impl ToolkitConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SEALWARD_CACHE_DIR` — credential cache root (default: platform cache dir + `sealward`)
    /// - `SEALWARD_LABEL` — Vault pod label selector (default: `app.kubernetes.io/name=vault`)
    /// - `SEALWARD_ACTIVE_LABEL` — leader marker label (default: `vault-active=true`)
    /// - `SEALWARD_LOCAL_PORT` — tunnel local port, `0` for ephemeral (default: `8200`)
    /// - `SEALWARD_POD_POLL_MS` — pod phase poll interval (default: `500`)
    /// - `SEALWARD_POD_TIMEOUT_SECS` — pod startup timeout (default: `300`)
    /// - `SEALWARD_TUNNEL_READY_SECS` — tunnel readiness timeout (default: `10`)
    /// - `SEALWARD_REQUEST_TIMEOUT_SECS` — Vault request timeout (default: `60`)
    /// - `SEALWARD_VAULT_SCHEME` — `http` or `https` (default: `http`)
    /// - `SEALWARD_LOG_LEVEL` — log filter (default: `info`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let cache_dir = lookup("SEALWARD_CACHE_DIR")
            .filter(|v| !v.is_empty())
            .map_or(defaults.cache_dir, PathBuf::from);

        let label = lookup("SEALWARD_LABEL")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.label);

        let active_label = lookup("SEALWARD_ACTIVE_LABEL")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.active_label);

        let local_port = lookup("SEALWARD_LOCAL_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .map_or(defaults.local_port, LocalPort::from_port);

        let pod_poll_interval = lookup("SEALWARD_POD_POLL_MS")
            .and_then(|v| v.parse().ok())
            .filter(|ms| *ms > 0)
            .map_or(defaults.pod_poll_interval, Duration::from_millis);

        let pod_startup_timeout = parse_secs(&lookup, "SEALWARD_POD_TIMEOUT_SECS")
            .unwrap_or(defaults.pod_startup_timeout);

        let tunnel_ready_timeout = parse_secs(&lookup, "SEALWARD_TUNNEL_READY_SECS")
            .unwrap_or(defaults.tunnel_ready_timeout);

        let request_timeout = parse_secs(&lookup, "SEALWARD_REQUEST_TIMEOUT_SECS")
            .unwrap_or(defaults.request_timeout);

        let vault_scheme = match lookup("SEALWARD_VAULT_SCHEME")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "https" => VaultScheme::Https,
            _ => VaultScheme::Http,
        };

        let log_level = lookup("SEALWARD_LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.log_level);

        Self {
            cache_dir,
            label,
            active_label,
            local_port,
            pod_poll_interval,
            pod_startup_timeout,
            tunnel_ready_timeout,
            request_timeout,
            vault_scheme,
            log_level,
        }
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sealward")
}
