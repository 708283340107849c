use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use ferrokv_common::config::NodeConfig;
use ferrokv_raftstore::LocalPdClient;
use ferrokv_server::Node;

#[derive(Parser, Debug)]
#[command(name = "ferrokv-server", about = "ferrokv transactional storage node")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "ferrokv.toml")]
    config: String,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<String>,

    /// Node address (overrides config).
    #[arg(long)]
    addr: Option<String>,

    /// Metrics listen address (overrides config).
    #[arg(long)]
    status_addr: Option<String>,

    /// Disable the WAL (pure in-memory mode).
    #[arg(long)]
    no_wal: bool,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let toml_str = toml::to_string_pretty(&NodeConfig::default())
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    ferrokv_observability::init_tracing();
    tracing::info!("Starting ferrokv...");

    let mut config = load_config(&cli.config);
    if let Some(ref dir) = cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(ref addr) = cli.addr {
        config.server.addr = addr.clone();
    }
    if let Some(ref addr) = cli.status_addr {
        config.server.status_addr = addr.clone();
    }
    if cli.no_wal {
        config.storage.wal_enabled = false;
    }
    config.validate().context("invalid configuration")?;
    tracing::info!("Config: {:?}", config);

    if let Err(e) = ferrokv_observability::init_metrics(&config.server.status_addr) {
        tracing::warn!("Failed to initialize metrics: {}", e);
    }

    let pd = Arc::new(LocalPdClient::new(config.pd.cluster_id));
    let node = tokio::task::spawn_blocking(move || Node::start(config, pd))
        .await
        .context("node start task failed")?
        .context("failed to start node")?;
    tracing::info!(store_id = node.store_id(), "node ready");

    let reason = wait_for_shutdown_signal().await;
    tracing::info!("{}, shutting down", reason);
    tokio::task::spawn_blocking(move || {
        let mut node = node;
        node.shutdown();
    })
    .await
    .context("node shutdown task failed")?;
    Ok(())
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}

fn load_config(path: &str) -> NodeConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match NodeConfig::from_toml(&content) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}, using defaults", path, e);
                NodeConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("Config file {} not found, using defaults", path);
            NodeConfig::default()
        }
    }
}
