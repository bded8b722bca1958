//! Configuration data types.

use crate::discovery::CatalogEntry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Pool and refresh settings
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Where service instances come from
    pub discovery: DiscoveryConfig,

    /// HTTP proxy in front of the balancer (disabled when absent)
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json, pretty, or compact
    #[serde(default)]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Balancer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    /// How often to reconcile pools with the registry
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Idle connections kept per service (0 selects the default)
    #[serde(default)]
    pub max_idle: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            max_idle: 0,
        }
    }
}

/// Registry backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    /// YAML catalog file, re-read on every refresh.
    File { path: PathBuf },

    /// In-memory registry seeded from this configuration.
    Static {
        /// Local datacenter; unfiltered lookups are scoped to it
        #[serde(default)]
        datacenter: Option<String>,

        #[serde(default)]
        services: Vec<CatalogEntry>,
    },
}

/// HTTP proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address and port to listen on
    pub listen: SocketAddr,

    /// Timeout for connecting to a service instance
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Serde adapter for humantime durations ("10s", "1m 30s").
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
