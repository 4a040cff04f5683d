//! Configuration management for Throttlegate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::info;

use crate::error::{Result, ThrottleError};

/// Main configuration for the Throttlegate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Caller identification
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Header names used to identify callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Header carrying the caller's API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Header carrying the proxy chain
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            api_key_header: default_api_key_header(),
            forwarded_header: default_forwarded_header(),
        }
    }
}

fn default_api_key_header() -> String {
    "API_KEY".to_string()
}

fn default_forwarded_header() -> String {
    "X-Forwarded-For".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per window for callers without an API key
    #[serde(default = "default_max_address_requests")]
    pub max_address_requests: u64,

    /// Requests allowed per window for callers with an API key
    #[serde(default = "default_max_token_requests")]
    pub max_token_requests: u64,

    /// Inactivity window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_address_requests: default_max_address_requests(),
            max_token_requests: default_max_token_requests(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_max_address_requests() -> u64 {
    10
}

fn default_max_token_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    5
}

/// Which counter store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(ThrottleError::Config(format!("unknown store backend '{}'", other))),
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Prefix prepended to every counter key
    #[serde(default)]
    pub key_prefix: String,

    /// How often the in-memory store drops expired counters, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            key_prefix: String::new(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_purge_interval() -> u64 {
    30
}

impl StoreConfig {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }
}

/// Flat view of the recognised environment variables.
///
/// `config::Environment` lowercases variable names, so
/// `MAX_REQUESTS_WITHOUT_TOKEN_PER_SECOND` lands on the field below.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    max_requests_without_token_per_second: Option<u64>,
    max_requests_with_token_per_second: Option<u64>,
    time_block_in_second: Option<u64>,
    redis_host: Option<String>,
    redis_port: Option<u16>,
    http_addr: Option<String>,
    store_backend: Option<String>,
}

impl ThrottleConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration file");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_source(::config::Environment::default())
    }

    /// Apply overrides from an explicit variable map instead of the process
    /// environment.
    pub fn apply_env_map(&mut self, vars: HashMap<String, String>) -> Result<()> {
        self.apply_env_source(::config::Environment::default().source(Some(vars.into_iter().collect())))
    }

    fn apply_env_source(&mut self, env: ::config::Environment) -> Result<()> {
        let overrides: EnvOverrides = ::config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ThrottleError::Config(format!("Failed to read environment: {}", e)))?;

        if let Some(v) = overrides.max_requests_without_token_per_second {
            self.rate_limiting.max_address_requests = v;
        }
        if let Some(v) = overrides.max_requests_with_token_per_second {
            self.rate_limiting.max_token_requests = v;
        }
        if let Some(v) = overrides.time_block_in_second {
            self.rate_limiting.window_secs = v;
        }
        if let Some(v) = overrides.redis_host {
            self.store.redis_host = v;
        }
        if let Some(v) = overrides.redis_port {
            self.store.redis_port = v;
        }
        if let Some(v) = overrides.http_addr {
            self.server.http_addr = v
                .parse()
                .map_err(|e| ThrottleError::Config(format!("invalid HTTP_ADDR '{}': {}", v, e)))?;
        }
        if let Some(v) = overrides.store_backend {
            self.store.backend = v.parse()?;
        }
        Ok(())
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.window_secs == 0 {
            return Err(ThrottleError::Config("window_secs must be greater than zero".into()));
        }
        if self.identity.api_key_header.trim().is_empty() {
            return Err(ThrottleError::Config("api_key_header must not be empty".into()));
        }
        if self.identity.forwarded_header.trim().is_empty() {
            return Err(ThrottleError::Config("forwarded_header must not be empty".into()));
        }
        crate::ratelimit::IdentityResolver::from_config(&self.identity)?;
        if self.store.backend == StoreBackend::Redis && self.store.redis_host.trim().is_empty() {
            return Err(ThrottleError::Config("redis_host is required for the redis backend".into()));
        }
        Ok(())
    }
}
