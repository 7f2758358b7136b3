use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, bail};
use serde::Deserialize;

/// Static, process-level configuration: which services exist, which port each
/// listens on, where the `~/.clp`-shaped state directory lives, and
/// observability knobs. This is hot-reloadable (see `reload.rs`) but is a
/// different layer from the per-service upstream pool (`store.rs`), which is
/// reloaded purely by (mtime, size) signature on access, never by a watcher.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceEndpoint>,
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.to_string_lossy()))?;
        let config: Self = toml::from_str(&content).with_context(|| {
            format!(
                "failed to parse TOML config from {}",
                path.to_string_lossy()
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.services.is_empty() {
            bail!("config must include at least one [[service]] block");
        }

        if !self.server.health_path.starts_with('/') {
            bail!("server.health_path must start with '/'");
        }

        let mut seen_ports = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for svc in &self.services {
            if svc.name.trim().is_empty() {
                bail!("service entry has empty name");
            }
            if !seen_names.insert(svc.name.clone()) {
                bail!("duplicate service name '{}'", svc.name);
            }
            if !seen_ports.insert(svc.port) {
                bail!("duplicate service port {}", svc.port);
            }
            if svc.failure_threshold == 0 {
                bail!("service '{}' failure_threshold must be > 0", svc.name);
            }
        }

        Ok(())
    }

    /// Resolve the state directory, expanding `~` like the original
    /// implementation did (`Path.home() / '.clp'`).
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.server.data_dir {
            return PathBuf::from(dir);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".clp")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Defaults to `CLP_PROXY_HOST` env var, then `127.0.0.1`, per spec §6.
    #[serde(default)]
    pub bind_host: Option<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub grace_period_seconds: Option<u64>,
    #[serde(default)]
    pub graceful_shutdown_timeout_seconds: Option<u64>,
    #[serde(default = "default_reload_debounce_ms")]
    pub config_reload_debounce_ms: u64,
    /// Bytes truncation limit for the traffic log's response body copy (§4.F).
    #[serde(default = "default_max_logged_response_bytes")]
    pub max_logged_response_bytes: usize,
    /// Max entries retained in the traffic log (§3, §4.F): `N = 1000`.
    #[serde(default = "default_traffic_log_limit")]
    pub traffic_log_limit: usize,
    /// Cap on the buffered inbound request body (`request_body_filter`
    /// bounds its buffering, per spec §0); requests whose body exceeds this
    /// are rejected with 413 rather than buffered without limit.
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: None,
            health_path: default_health_path(),
            data_dir: None,
            threads: None,
            grace_period_seconds: None,
            graceful_shutdown_timeout_seconds: None,
            config_reload_debounce_ms: default_reload_debounce_ms(),
            max_logged_response_bytes: default_max_logged_response_bytes(),
            traffic_log_limit: default_traffic_log_limit(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn resolved_bind_host(&self) -> String {
        self.bind_host
            .clone()
            .or_else(|| std::env::var("CLP_PROXY_HOST").ok())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }
}

fn default_reload_debounce_ms() -> u64 {
    250
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_max_logged_response_bytes() -> usize {
    1024 * 1024
}

fn default_traffic_log_limit() -> usize {
    1000
}

fn default_max_request_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub access_log: bool,
    #[serde(default)]
    pub prometheus_listen: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            access_log: true,
            prometheus_listen: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One logical upstream-fronting service, e.g. `claude` on 3210 or `codex` on
/// 3211 (spec §6 defaults). Each gets its own listener and its own `~/.clp`
/// state files (`<service>.json`, `data/lb_config.json`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub lb_mode: LbMode,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub auto_reset_on_all_failed: bool,
    #[serde(default = "default_reset_cooldown_seconds")]
    pub reset_cooldown_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_reset_cooldown_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LbMode {
    ActiveFirst,
    #[default]
    WeightBased,
}
