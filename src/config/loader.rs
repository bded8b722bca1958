//! Configuration file loading.

use crate::config::{Config, validate_config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Read, parse and validate a YAML configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn config_file(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_config() {
        let file = config_file(
            r#"
discovery:
  type: file
  path: /var/lib/reglb/catalog.yaml
"#,
        );

        let config = load_config(file.path()).unwrap();
        assert!(matches!(config.discovery, DiscoveryConfig::File { .. }));
        assert_eq!(config.balancer.refresh_interval, Duration::from_secs(10));
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let file = config_file(
            r#"
global:
  log_level: debug
  log_format: compact
  metrics:
    enabled: true
    address: "127.0.0.1:9100"
balancer:
  refresh_interval: 2s
  max_idle: 64
discovery:
  type: static
  datacenter: dc1
  services:
    - id: api-1
      name: api
      address: "127.0.0.1:9001"
      status: passing
    - id: api-2
      name: api
      address: "127.0.0.1:9002"
      tags: ["CPU_USAGE=10"]
      status: passing
proxy:
  listen: "127.0.0.1:8080"
  connect_timeout: 500ms
"#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.balancer.max_idle, 64);
        assert_eq!(config.balancer.refresh_interval, Duration::from_secs(2));
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.connect_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.yaml");
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let file = config_file("not: valid: yaml: {{{}}}");
        assert!(matches!(
            load_config(file.path()).unwrap_err(),
            ConfigError::ParseError(_)
        ));
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let file = config_file(
            r#"
balancer:
  refresh_interval: 0s
discovery:
  type: file
  path: catalog.yaml
"#,
        );
        assert!(matches!(
            load_config(file.path()).unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }
}
