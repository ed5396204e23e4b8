use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use pve_api::{
    http::ProxmoxClient, registry::ProxmoxRegistry, ConnectionRegistry, CounterSource,
};
use tokio::{select, signal, time};
use vmtraffic::{config::Config, service::CollectorService, store::sqlite::SqliteStore};

/// Per-VM network traffic collector for Proxmox VE.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Logging level
    #[arg(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path, overrides the configuration.
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Run a single polling round, print its summary and exit.
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let text_subscriber = tracing_subscriber::fmt()
        .with_ansi(true)
        .with_max_level(args.log_level)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(text_subscriber)?;

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(database) = args.database {
        config.database = database;
    }

    if config.connections.is_empty() {
        tracing::warn!("No Proxmox connection configured, nothing will be collected");
    }

    let registry = Arc::new(ProxmoxRegistry::new());

    for connection in config.connections.iter().cloned() {
        let id = connection.id.clone();
        let client = ProxmoxClient::new(connection, config.source_timeout())
            .with_context(|| format!("Unable to set up connection {id}"))?;

        registry.add(client);
    }

    registry.refresh().await;

    let store = Arc::new(
        SqliteStore::open(&config.database)
            .await
            .with_context(|| format!("Unable to open {}", config.database.display()))?,
    );

    let service = CollectorService::new(
        Arc::clone(&registry) as Arc<dyn ConnectionRegistry>,
        Arc::clone(&registry) as Arc<dyn CounterSource>,
        store,
        &config,
    );

    if args.once {
        let summary = service.collect_now().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);

        return Ok(());
    }

    service.start().await?;

    let refresh_registry = Arc::clone(&registry);
    let refresh_period = config.registry_refresh();
    let refresher = tokio::spawn(async move {
        let mut ticker = time::interval(refresh_period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            refresh_registry.refresh().await;
        }
    });

    select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Unable to listen for shutdown signal: {e}");
            }
        }
        res = refresher => tracing::warn!("Registry refresh returned: {res:?}"),
    };

    tracing::info!("Stopping");
    service.stop().await;

    Ok(())
}
