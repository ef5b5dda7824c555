use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hazardwatch::environment::WatchConfig;
use hazardwatch::logging::configure_logging;
use hazardwatch::{AlertProvider, AlertRecord, Aggregator, Poller};

/// Fetch live hazard alerts and print them.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Region to filter by (defaults to HAZARD_REGION or "All India")
    #[arg(short, long)]
    region: Option<String>,

    /// Poll interval in minutes (defaults to HAZARD_POLL_MINUTES or 5)
    #[arg(short, long)]
    minutes: Option<u64>,

    /// Aggregate once, print, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();
    let args = Args::parse();

    let config = WatchConfig::from_env()?;
    let region = args.region.unwrap_or(config.region);
    let minutes = args.minutes.unwrap_or(config.poll_minutes);
    for source in &config.sources {
        info!("Source: {} ({:?}) {}", source.label, source.kind, source.url);
    }

    let aggregator = Arc::new(Aggregator::new(config.sources, config.policy)?);

    if args.once {
        let alerts = aggregator.aggregate(&region, &CancellationToken::new()).await;
        print_alerts(&alerts);
        return Ok(());
    }

    let poller = Poller::with_region(aggregator, region);
    let _subscription = poller.subscribe(|snapshot| print_alerts(snapshot));
    poller.start(minutes)?;

    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", err);
    }
    info!("Ctrl-C received, stopping alert polling.");
    poller.stop().await;
    Ok(())
}

fn print_alerts(alerts: &[AlertRecord]) {
    println!("{} alert(s) at {}", alerts.len(), chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    for alert in alerts {
        println!(
            "  [{}] {} ({}) - {}",
            alert.severity, alert.title, alert.area, alert.source
        );
        if !alert.summary.is_empty() {
            println!("      {}", alert.summary);
        }
    }
}
