//! Microstructure engine CLI
//!
//! `simulate` runs the engine against the synthetic feed and prints a
//! latency and throughput report; `validate-config` checks a TOML file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use microstructure::config::{ConfigHandle, EngineConfig, watch_file};
use microstructure::engine::Engine;
use microstructure::model::{PatternModel, SoftmaxPatternModel};
use microstructure::publisher::Subscription;
use microstructure::sim::{FeedConfig, IcebergConfig, SyntheticFeed, simulate};
use services_common::{Symbol, Ts};
use tracing::{info, warn};

/// Order book microstructure engine
#[derive(Parser)]
#[clap(name = "microstructure")]
#[clap(about = "Real-time order book liquidity analytics and pattern classification")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Configuration file (TOML); defaults apply when omitted
    #[clap(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against a synthetic feed
    Simulate {
        /// Total events to submit
        #[clap(long, default_value = "1000000")]
        events: u64,

        /// Number of symbols
        #[clap(long, default_value = "4")]
        symbols: u32,

        /// Submission rate in events per second (unpaced when omitted)
        #[clap(long)]
        rate: Option<u64>,

        /// Probability of withholding an event to force a resync
        #[clap(long, default_value = "0.0")]
        gap_probability: f64,

        /// Put a replenishing iceberg on the first symbol
        #[clap(long)]
        iceberg: bool,

        /// RNG seed
        #[clap(long, default_value = "42")]
        seed: u64,

        /// Capacity of the report consumer's queue
        #[clap(long, default_value = "65536")]
        consumer_capacity: usize,

        /// Poll the config file for changes while running
        #[clap(long)]
        watch: bool,
    },

    /// Parse and validate a configuration file, then print it resolved
    ValidateConfig {
        /// File to check
        path: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn drain_consumer(subscription: Subscription, mut shutdown: tokio::sync::watch::Receiver<bool>) -> u64 {
    let mut received = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                received += subscription.drain().len() as u64;
            }
            _ = shutdown.changed() => {
                received += subscription.drain().len() as u64;
                return received;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_simulation(
    config_path: Option<PathBuf>,
    events: u64,
    symbols: u32,
    rate: Option<u64>,
    gap_probability: f64,
    iceberg: bool,
    seed: u64,
    consumer_capacity: usize,
    watch: bool,
) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    let model_path = config.model_artifact.clone();
    let handle = Arc::new(ConfigHandle::new(config)?);

    let mut builder = Engine::builder(Arc::clone(&handle));
    let subscription = builder.subscribe("report", consumer_capacity);
    if let Some(path) = model_path {
        let model = SoftmaxPatternModel::load(&path).with_context(|| format!("loading model {}", path.display()))?;
        let metadata = model.metadata();
        info!(name = %metadata.name, version = %metadata.version, path = %path.display(), "Model artifact loaded");
        builder = builder.model(Arc::new(model));
    }
    let (engine, snapshot_requests) = builder.start()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let watcher = match (watch, config_path) {
        (true, Some(path)) => Some(tokio::spawn(watch_file(
            Arc::clone(&handle),
            path,
            Duration::from_millis(500),
            shutdown_rx.clone(),
        ))),
        (true, None) => {
            warn!("--watch needs --config; not watching");
            None
        }
        _ => None,
    };
    let consumer = tokio::spawn(drain_consumer(subscription, shutdown_rx));

    let mut feeds: Vec<SyntheticFeed> = (0..symbols.max(1))
        .map(|i| {
            let feed_config = FeedConfig {
                symbol: Symbol::new(i + 1),
                seed: seed.wrapping_add(u64::from(i)),
                gap_probability,
                iceberg: (iceberg && i == 0)
                    .then_some(IcebergConfig { display_size: 500, hit_probability: 0.05 }),
                ..FeedConfig::default()
            };
            SyntheticFeed::new(feed_config, Ts::now())
        })
        .collect();

    info!(events, symbols, ?rate, "Starting simulation");
    let (engine, report) = tokio::task::spawn_blocking(move || {
        let report = simulate(&engine, &mut feeds, &snapshot_requests, events, rate);
        (engine, report)
    })
    .await
    .context("simulation task failed")?;
    let report = report?;

    let _ = shutdown_tx.send(true);
    let consumed = consumer.await.context("consumer task failed")?;
    if let Some(watcher) = watcher {
        watcher.await.context("config watcher failed")?;
    }

    let stats = engine.stats();
    let governors = engine.governor_states();
    let consumers = engine.publisher().consumer_stats();
    engine.shutdown()?;

    println!("{}", stats.format_report());
    println!(
        "Simulation: {} events submitted, {} withheld, {} snapshots served, {:.0} events/s",
        report.events_submitted,
        report.events_withheld,
        report.snapshots_served,
        report.events_per_second()
    );
    println!("Governor states: {governors:?}");
    for consumer in consumers {
        println!(
            "Consumer {}: {} delivered, {} dropped, {} read",
            consumer.name, consumer.delivered, consumer.dropped, consumed
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { events, symbols, rate, gap_probability, iceberg, seed, consumer_capacity, watch } => {
            run_simulation(cli.config, events, symbols, rate, gap_probability, iceberg, seed, consumer_capacity, watch)
                .await?;
        }
        Commands::ValidateConfig { path } => {
            let config = load_config(Some(&path))?;
            info!(path = %path.display(), workers = config.resolved_workers(), "Configuration is valid");
            println!("{}", toml::to_string_pretty(&config).context("rendering configuration")?);
        }
    }

    Ok(())
}
