//! Proxy configuration with TOML file support.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Configuration for a palisade proxy instance.
///
/// Can be loaded from a TOML file via [`ProxyConfig::from_toml_file`] or
/// built programmatically (e.g. for tests). The daemon layers CLI and
/// environment overrides on top.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to bind.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port to listen on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// PEM certificate chain for TLS termination. Unset (together with
    /// the key) means plain HTTP, for local development only.
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,

    /// PEM private key for TLS termination.
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,

    /// Primary upstream RPC node.
    #[serde(default)]
    pub primary_url: String,

    /// Optional fallback upstream. Without one the circuit breaker never
    /// opens.
    #[serde(default)]
    pub fallback_url: Option<String>,

    /// Postgres connection string for the counter store.
    #[serde(default)]
    pub database_url: String,

    /// Counter store connection pool size.
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    /// Aggregator flush cadence, seconds.
    #[serde(default = "default_background_interval")]
    pub background_tasks_interval_secs: u64,

    /// Limiter store-poll cadence, seconds.
    #[serde(default = "default_poll_interval")]
    pub rate_limit_poll_interval_secs: u64,

    /// Sliding-window ceiling per public origin. Zero disables.
    #[serde(default)]
    pub origin_hourly_limit: u64,

    /// Sliding-window ceiling per IP (LocalLike tier). Zero disables.
    #[serde(default)]
    pub ip_hourly_limit: u64,

    /// Midnight-UTC cap per public origin. Zero disables.
    #[serde(default)]
    pub origin_daily_limit: u64,

    /// Midnight-UTC cap per IP. Zero disables.
    #[serde(default)]
    pub ip_daily_limit: u64,

    /// Key for the admin endpoints. Unset disables them entirely.
    #[serde(default)]
    pub admin_api_key: Option<String>,

    /// Newline-delimited IP deny list, hot-reloaded.
    #[serde(default)]
    pub blacklist_path: Option<PathBuf>,

    /// Append-only log of rejected requests.
    #[serde(default = "default_reject_log_path")]
    pub reject_log_path: Option<PathBuf>,

    /// Primary upstream POST budget, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Total fallback POST budget, seconds.
    #[serde(default = "default_fallback_timeout")]
    pub fallback_timeout_secs: u64,

    /// Consecutive primary failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before probing the primary again.
    #[serde(default = "default_breaker_reset")]
    pub breaker_reset_timeout_secs: u64,

    /// Origins whose traffic is synthetic monitoring, never billed.
    #[serde(default)]
    pub synthetic_origins: Vec<String>,

    /// Accept unverifiable upstream certificates.
    #[serde(default)]
    pub accept_invalid_upstream_certs: bool,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    443
}

fn default_db_pool_size() -> u32 {
    8
}

fn default_background_interval() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    10
}

fn default_reject_log_path() -> Option<PathBuf> {
    Some(PathBuf::from("rejected_requests.log"))
}

fn default_request_timeout() -> u64 {
    10
}

fn default_fallback_timeout() -> u64 {
    15
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_breaker_reset() -> u64 {
    60
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, ServerError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ServerError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ServerError> {
        toml::from_str(s).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("ProxyConfig is always serializable to TOML")
    }

    /// Reject configurations the proxy cannot start with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.primary_url.is_empty() {
            return Err(ServerError::Config("primary_url is required".into()));
        }
        if self.database_url.is_empty() {
            return Err(ServerError::Config("database_url is required".into()));
        }
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) | (None, Some(_)) => Err(ServerError::Config(
                "tls_cert_path and tls_key_path must be set together".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            tls_cert_path: None,
            tls_key_path: None,
            primary_url: String::new(),
            fallback_url: None,
            database_url: String::new(),
            db_pool_size: default_db_pool_size(),
            background_tasks_interval_secs: default_background_interval(),
            rate_limit_poll_interval_secs: default_poll_interval(),
            origin_hourly_limit: 0,
            ip_hourly_limit: 0,
            origin_daily_limit: 0,
            ip_daily_limit: 0,
            admin_api_key: None,
            blacklist_path: None,
            reject_log_path: default_reject_log_path(),
            request_timeout_secs: default_request_timeout(),
            fallback_timeout_secs: default_fallback_timeout(),
            failure_threshold: default_failure_threshold(),
            breaker_reset_timeout_secs: default_breaker_reset(),
            synthetic_origins: Vec::new(),
            accept_invalid_upstream_certs: false,
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}
