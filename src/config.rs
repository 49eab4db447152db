//! WolfLeader Configuration
//!
//! This module provides configuration structures for the WolfLeader
//! election node. Everything except `service.name` has a default, so the
//! smallest useful file is a single `[service]` table.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfLeader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfLeaderConfig {
    /// Service identity configuration
    pub service: ServiceConfig,

    /// Consul agent connection configuration
    #[serde(default)]
    pub consul: ConsulConfig,

    /// TTL health check configuration
    #[serde(default)]
    pub check: CheckConfig,

    /// Election loop configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Status API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Logical service name shared by every competing instance
    pub name: String,

    /// Explicit instance id (defaults to `{name}-{start millis}`)
    #[serde(default)]
    pub id: Option<String>,
}

/// Consul agent connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Agent HTTP address
    #[serde(default = "default_consul_address")]
    pub address: String,

    /// ACL token sent as `X-Consul-Token`
    #[serde(default)]
    pub token: Option<String>,

    /// Datacenter for session and KV requests
    #[serde(default)]
    pub datacenter: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum blocking query wait in seconds
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

/// TTL health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Check TTL in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Deregister the service after it has been critical this long
    #[serde(default = "default_deregister_after_secs")]
    pub deregister_after_secs: u64,

    /// How often the check is reported as passing (must be below the TTL)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Deregister the service when the node shuts down
    #[serde(default = "default_true")]
    pub deregister_on_shutdown: bool,
}

/// Election loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// First retry delay after a coordination failure
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound for retry delays
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Session lock-delay: how long a lock released by an invalidated
    /// session stays unacquirable
    #[serde(default = "default_lock_delay_secs")]
    pub lock_delay_secs: u64,

    /// Release the leadership key and destroy the session on shutdown
    #[serde(default = "default_true")]
    pub release_on_shutdown: bool,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_consul_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_wait_secs() -> u64 {
    600
}

fn default_ttl_secs() -> u64 {
    20
}

fn default_deregister_after_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_backoff_initial_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_lock_delay_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            token: None,
            datacenter: None,
            connect_timeout_secs: default_connect_timeout(),
            wait_secs: default_wait_secs(),
        }
    }
}

impl ConsulConfig {
    /// Get the connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            deregister_after_secs: default_deregister_after_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            deregister_on_shutdown: true,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            lock_delay_secs: default_lock_delay_secs(),
            release_on_shutdown: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl WolfLeaderConfig {
    /// Build a configuration with defaults for everything but the service name
    pub fn for_service(name: impl Into<String>) -> Self {
        Self {
            service: ServiceConfig {
                name: name.into(),
                id: None,
            },
            consul: ConsulConfig::default(),
            check: CheckConfig::default(),
            election: ElectionConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfLeaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.service.name.is_empty() {
            return Err(crate::Error::Config("service.name cannot be empty".into()));
        }

        if self.service.name.contains('/') {
            return Err(crate::Error::Config("service.name cannot contain '/'".into()));
        }

        if matches!(self.service.id.as_deref(), Some("")) {
            return Err(crate::Error::Config("service.id cannot be empty when set".into()));
        }

        if self.consul.address.is_empty() {
            return Err(crate::Error::Config("consul.address cannot be empty".into()));
        }

        if self.check.ttl_secs == 0 {
            return Err(crate::Error::Config("check.ttl_secs must be positive".into()));
        }

        if self.check.heartbeat_interval_secs == 0
            || self.check.heartbeat_interval_secs >= self.check.ttl_secs
        {
            return Err(crate::Error::Config(format!(
                "check.heartbeat_interval_secs ({}) must be between 1 and ttl_secs ({})",
                self.check.heartbeat_interval_secs, self.check.ttl_secs
            )));
        }

        if self.consul.wait_secs == 0 {
            return Err(crate::Error::Config("consul.wait_secs must be positive".into()));
        }

        if self.election.backoff_initial_ms == 0
            || self.election.backoff_initial_ms > self.election.backoff_max_ms
        {
            return Err(crate::Error::Config(
                "election.backoff_initial_ms must be positive and not above backoff_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// Get the check TTL as Duration
    pub fn check_ttl(&self) -> Duration {
        Duration::from_secs(self.check.ttl_secs)
    }

    /// Get the deregister-critical-after grace period as Duration
    pub fn deregister_after(&self) -> Duration {
        Duration::from_secs(self.check.deregister_after_secs)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.check.heartbeat_interval_secs)
    }

    /// Get the blocking query wait as Duration
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.consul.wait_secs)
    }

    /// Get the initial retry backoff as Duration
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.election.backoff_initial_ms)
    }

    /// Get the maximum retry backoff as Duration
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.election.backoff_max_ms)
    }

    /// Get the session lock-delay as Duration
    pub fn lock_delay(&self) -> Duration {
        Duration::from_secs(self.election.lock_delay_secs)
    }

    /// Render a commented starter configuration
    pub fn template(service_name: &str) -> String {
        format!(
            r#"# WolfLeader configuration

[service]
name = "{service_name}"
# id = "{service_name}-1"

[consul]
address = "{address}"
# token = ""
# datacenter = "dc1"
connect_timeout_secs = {connect}
wait_secs = {wait}

[check]
ttl_secs = {ttl}
deregister_after_secs = {dereg}
heartbeat_interval_secs = {hb}
deregister_on_shutdown = true

[election]
backoff_initial_ms = {bi}
backoff_max_ms = {bm}
lock_delay_secs = {ld}
release_on_shutdown = true

[api]
enabled = true
bind_address = "{api}"

[logging]
level = "info"
format = "pretty"
"#,
            address = default_consul_address(),
            connect = default_connect_timeout(),
            wait = default_wait_secs(),
            ttl = default_ttl_secs(),
            dereg = default_deregister_after_secs(),
            hb = default_heartbeat_interval_secs(),
            bi = default_backoff_initial_ms(),
            bm = default_backoff_max_ms(),
            ld = default_lock_delay_secs(),
            api = default_api_address(),
        )
    }
}
