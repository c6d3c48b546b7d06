use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rentscan_collect::config::CollectorConfig;
use rentscan_collect::discovery::OperatorGate;
use rentscan_collect::filters::{BedroomFilter, DaysOnMarket, LaundryFilter, ListingFilter, Toggle};
use rentscan_collect::{CollectRequest, Collector};
use rentscan_core::{RunState, RunStatus};
use rentscan_storage::{load_snapshot, read_status, StatusReporter, StopSignal, LATEST_FILE};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rentscan")]
#[command(about = "Rental history collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover buildings in an area and collect their rental history.
    Collect(CollectArgs),
    /// Print the current run status.
    Status,
    /// Ask a running collection to stop after its in-flight work.
    Stop,
    /// Summarize a snapshot file (defaults to the latest one).
    Summary { path: Option<PathBuf> },
}

#[derive(Debug, Args)]
struct CollectArgs {
    #[arg(long)]
    area: String,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    min_price: Option<f64>,
    #[arg(long)]
    max_price: Option<f64>,
    #[arg(long, default_value = "all")]
    bedrooms: BedroomFilter,
    #[arg(long, default_value = "all")]
    by_owner: Toggle,
    #[arg(long, default_value = "all")]
    laundry: LaundryFilter,
    #[arg(long, default_value = "all")]
    pets: Toggle,
    #[arg(long, default_value = "all")]
    outdoor: Toggle,
    #[arg(long, default_value = "all")]
    days_on_market: DaysOnMarket,
    /// First month (1-12) of the off-market window.
    #[arg(long)]
    off_market_start: Option<u32>,
    #[arg(long)]
    off_market_end: Option<u32>,
}

impl CollectArgs {
    fn filter(&self) -> ListingFilter {
        ListingFilter {
            min_price: self.min_price,
            max_price: self.max_price,
            bedrooms: self.bedrooms,
            by_owner: self.by_owner,
            laundry: self.laundry,
            pets: self.pets,
            outdoor: self.outdoor,
            days_on_market: self.days_on_market,
            off_market_month_start: self.off_market_start,
            off_market_month_end: self.off_market_end,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();
}

async fn collect(mut config: CollectorConfig, args: CollectArgs) -> Result<()> {
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }

    let (confirmations, gate) = OperatorGate::channel(config.challenge_timeout());
    let stop = StopSignal::new(&config.stop_signal_file);
    let collector = Collector::from_config(config, Arc::new(gate), stop.clone())?;

    // Each line on stdin confirms a solved challenge. A plain thread so a pending read
    // never holds up process exit.
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() {
                break;
            }
            confirmations.send_modify(|generation| *generation += 1);
        }
    });

    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight buildings before stopping");
                stop.request();
            }
        }
    });

    let request = CollectRequest {
        area: args.area.clone(),
        filter: args.filter(),
    };
    let summary = collector.run(&request).await?;
    println!(
        "{} {}: buildings={} processed={} (ok {}, empty {}, errors {}) listings={} written={} prices_updated={}",
        if summary.stopped { "stopped" } else { "completed" },
        summary.area,
        summary.buildings_discovered,
        summary.buildings_processed,
        summary.stats.success,
        summary.stats.empty,
        summary.stats.errors,
        summary.listings_collected,
        summary.listings_written,
        summary.prices_updated,
    );
    if let Some(path) = summary.snapshot {
        println!("snapshot: {}", path.display());
    }
    Ok(())
}

async fn summarize(config: &CollectorConfig, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(|| config.output_dir.join(LATEST_FILE));
    let snapshot = load_snapshot(&path).await?;
    let listings = &snapshot.listings;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for listing in listings {
        *by_status.entry(listing.status_upper()).or_default() += 1;
    }
    let owners = listings.iter().filter(|l| l.is_owner).count();
    let stabilized = listings.iter().filter(|l| l.likely_stabilized).count();
    let buildings = listings
        .iter()
        .map(|l| l.building_slug.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();

    println!("{}", path.display());
    println!(
        "area={} taken={} method={}{}",
        snapshot.metadata.area,
        snapshot.metadata.timestamp.to_rfc3339(),
        snapshot.metadata.collection_method,
        if snapshot.metadata.is_backup == Some(true) { " (backup)" } else { "" }
    );
    println!(
        "listings={} buildings={buildings} by_owner={owners} likely_stabilized={stabilized}",
        listings.len()
    );
    for (status, count) in by_status {
        let label = if status.is_empty() { "UNKNOWN" } else { status.as_str() };
        println!("  {label}: {count}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CollectorConfig::from_env();

    match cli.command {
        Commands::Collect(args) => collect(config, args).await?,
        Commands::Status => match read_status(&config.status_file).await? {
            Some(status) => println!(
                "{}",
                serde_json::to_string_pretty(&status).context("formatting run status")?
            ),
            None => println!("no run status at {}", config.status_file.display()),
        },
        Commands::Stop => {
            StopSignal::request_file(&config.stop_signal_file).await?;
            StatusReporter::new(&config.status_file)
                .publish(&RunStatus::new(RunState::Stopping).with_message("Stop requested"))
                .await;
            info!(path = %config.stop_signal_file.display(), "stop signal written");
        }
        Commands::Summary { path } => summarize(&config, path).await?,
    }

    Ok(())
}
