//! Configuration management for Gatekeeper.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables prefixed `GATEKEEPER__` with `__` separating
//! nested keys (e.g. `GATEKEEPER__RATE_LIMITING__IP__LIMIT=20`).

use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo, RedisResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::PolicyRule;

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "GATEKEEPER";
/// Separator between prefix and nested keys in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
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

/// Which counter backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local maps
    Memory,
}

/// Counter backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Full connection URL; overrides the individual fields when set
    #[serde(default)]
    pub url: Option<String>,

    /// Redis host
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Database index
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisConfig {
    /// Connection info for the configured Redis.
    ///
    /// `url` wins when set. Otherwise the host, port, database and password
    /// are passed as they are, with no URL encoding involved.
    pub fn connection_info(&self) -> RedisResult<ConnectionInfo> {
        if let Some(ref url) = self.url {
            return url.as_str().into_connection_info();
        }

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        })
    }
}

/// What to do with a request when the counter backend fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through
    Open,
    /// Reject the request with 503 Service Unavailable
    #[default]
    Closed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policy for anonymous traffic keyed by source address
    #[serde(default = "default_ip_policy")]
    pub ip: PolicyRule,

    /// Policy for tokens without a recognised tier
    #[serde(default = "default_token_policy")]
    pub token: PolicyRule,

    /// Named token tiers
    #[serde(default)]
    pub tiers: HashMap<String, PolicyRule>,

    /// Path to a YAML file of additional tier rules
    #[serde(default)]
    pub tiers_path: Option<String>,

    /// Fixed window for counters in seconds; counters never expire when unset
    #[serde(default)]
    pub counter_window_secs: Option<u64>,

    /// Behaviour when the counter backend fails
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            ip: default_ip_policy(),
            token: default_token_policy(),
            tiers: HashMap::new(),
            tiers_path: None,
            counter_window_secs: None,
            failure_mode: FailureMode::default(),
        }
    }
}

fn default_ip_policy() -> PolicyRule {
    PolicyRule::new(10, 60)
}

fn default_token_policy() -> PolicyRule {
    PolicyRule::new(11, 60)
}

impl RateLimitingConfig {
    /// The counter window as a duration.
    pub fn counter_window(&self) -> Option<Duration> {
        self.counter_window_secs.map(Duration::from_secs)
    }
}

impl GatekeeperConfig {
    /// Load configuration from defaults, an optional YAML file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize cleanly but cannot be used.
    pub fn validate(&self) -> Result<()> {
        let rate_limiting = &self.rate_limiting;
        let rules = [("ip", &rate_limiting.ip), ("token", &rate_limiting.token)]
            .into_iter()
            .chain(
                rate_limiting
                    .tiers
                    .iter()
                    .map(|(label, rule)| (label.as_str(), rule)),
            );

        for (name, rule) in rules {
            if rule.limit == 0 {
                return Err(GatekeeperError::Config(format!(
                    "policy '{}' must have a limit greater than zero",
                    name
                )));
            }
            if rule.block_duration_secs == 0 {
                return Err(GatekeeperError::Config(format!(
                    "policy '{}' must have a block duration greater than zero",
                    name
                )));
            }
        }

        if rate_limiting.counter_window_secs == Some(0) {
            return Err(GatekeeperError::Config(
                "counter_window_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
