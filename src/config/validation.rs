//! Configuration validation.

use crate::config::{Config, DiscoveryConfig};
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - A non-zero refresh interval
/// - A catalog path for file discovery
/// - Unique, named, addressable static services
/// - A metrics path starting with `/`
/// - Distinct proxy and metrics listen addresses
///
/// All problems are reported together, joined by `; `.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.balancer.refresh_interval.is_zero() {
        errors.push("balancer refresh_interval must be greater than zero".to_string());
    }

    match &config.discovery {
        DiscoveryConfig::File { path } => {
            if path.as_os_str().is_empty() {
                errors.push("file discovery requires a path".to_string());
            }
        }
        DiscoveryConfig::Static { services, .. } => {
            let mut ids = HashSet::new();
            for entry in services {
                let options = &entry.options;
                if options.id.is_empty() {
                    errors.push(format!("service '{}' has an empty id", options.name));
                } else if !ids.insert(options.id.as_str()) {
                    errors.push(format!("duplicate service id: {}", options.id));
                }

                if options.name.is_empty() {
                    errors.push(format!("service '{}' has an empty name", options.id));
                }

                if let Err(e) = options.service() {
                    errors.push(format!("service '{}': {}", options.id, e));
                }
            }
        }
    }

    let metrics = &config.global.metrics;
    if metrics.enabled {
        if !metrics.path.starts_with('/') {
            errors.push(format!(
                "metrics path '{}' must start with '/'",
                metrics.path
            ));
        }

        if let Some(proxy) = &config.proxy {
            if proxy.listen == metrics.address {
                errors.push(format!(
                    "proxy and metrics cannot share listen address {}",
                    proxy.listen
                ));
            }
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
