use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tether_broker::{Broker, BrokerConfig, InMemoryRegistry};

#[derive(Parser, Debug)]
#[command(author, version, about = "tether resource-ownership broker")]
struct Args {
    /// TOML config file. Missing file means defaults.
    #[arg(long, default_value = "tether.toml")]
    config: PathBuf,
    /// Listen address (overrides the config file).
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Liveness window in milliseconds (overrides the config file).
    #[arg(long)]
    liveness_ms: Option<u64>,
    /// Resource to register (can be repeated; added to the config file's list).
    #[arg(long = "resource")]
    resources: Vec<String>,
    /// Start in drain mode: sessions connect but no ownership is granted.
    #[arg(long)]
    drain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_broker=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = BrokerConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(ms) = args.liveness_ms {
        config.liveness_window_ms = ms;
    }
    if args.drain {
        config.accept_on_start = false;
    }
    config.resources.extend(args.resources);

    let registry = Arc::new(InMemoryRegistry::with_resources(config.resources.iter().cloned()));
    if registry.is_empty() {
        tracing::warn!("no resources registered; every ownership request will be refused");
    }

    let broker = Broker::new(config, registry.clone());
    broker.start().await.context("broker failed to start")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("received SIGINT, shutting down");
    broker.stop().await;

    for resource in registry.snapshot() {
        tracing::debug!(
            resource = %resource.name,
            generation = resource.generation,
            "final state"
        );
    }
    Ok(())
}
