//! reglb - a registry-driven client-side load balancer
//!
//! Usage:
//!     reglb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use reglb::Balancer;
use reglb::config::{Config, DiscoveryConfig, load_config};
use reglb::discovery::{Discovery, FileDiscovery, MemoryDiscovery};
use reglb::metrics::{MetricsCollector, MetricsServer};
use reglb::proxy::HttpProxy;
use reglb::util::init_logging;

/// A registry-driven client-side load balancer.
#[derive(Parser, Debug)]
#[command(name = "reglb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        match &config.discovery {
            DiscoveryConfig::File { path } => {
                println!("  Discovery: file ({})", path.display());
            }
            DiscoveryConfig::Static { services, .. } => {
                println!("  Discovery: static ({} services)", services.len());
                for entry in services {
                    println!(
                        "    - {} ({}) -> {} [{}]",
                        entry.options.id, entry.options.name, entry.options.address, entry.status
                    );
                }
            }
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        refresh_interval = ?config.balancer.refresh_interval,
        proxy = config.proxy.is_some(),
        "reglb starting"
    );

    run(config)
}

/// Run the balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Build the registry backend named by the configuration.
async fn build_discovery(config: &DiscoveryConfig) -> Result<Arc<dyn Discovery>> {
    match config {
        DiscoveryConfig::File { path } => {
            info!(path = %path.display(), "using catalog file discovery");
            Ok(Arc::new(FileDiscovery::new(path)))
        }
        DiscoveryConfig::Static {
            datacenter,
            services,
        } => {
            let discovery = match datacenter {
                Some(dc) => MemoryDiscovery::with_datacenter(dc),
                None => MemoryDiscovery::new(),
            };

            for entry in services {
                discovery
                    .register(entry.options.clone())
                    .await
                    .with_context(|| format!("failed to register '{}'", entry.options.id))?;
                discovery.set_status(&entry.options.id, entry.status)?;
            }

            info!(services = discovery.len(), "using static discovery");
            Ok(Arc::new(discovery))
        }
    }
}

async fn run_async(config: Config) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let discovery = build_discovery(&config.discovery).await?;
    let balancer = Balancer::with_metrics(
        discovery,
        config.balancer.max_idle,
        MetricsCollector::new(),
    );

    let mut handles = Vec::new();

    handles.push(balancer.supervisor(config.balancer.refresh_interval));

    let metrics = &config.global.metrics;
    if metrics.enabled {
        let server = MetricsServer::new(metrics.address, metrics.path.clone(), balancer.clone());
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            server.run(shutdown_rx).await;
        }));
    }

    if let Some(proxy_config) = &config.proxy {
        let proxy = HttpProxy::bind(proxy_config, balancer.clone())
            .await
            .with_context(|| format!("failed to bind proxy on {}", proxy_config.listen))?;
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            proxy.run(shutdown_rx).await;
        }));
    } else {
        warn!("no proxy configured, only the metrics endpoint is served");
    }

    info!("reglb is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    balancer.stop();
    let _ = shutdown_tx.send(());

    for handle in handles {
        let _ = handle.await;
    }

    info!("reglb shut down complete");
    Ok(())
}
