// Runs the reporter against the log client with a synthetic collector

use anyhow::Result;
use batchmetrics::client::LogClient;
use batchmetrics::collector::FnCollector;
use batchmetrics::config::{LogLevel, ReporterConfig};
use batchmetrics::prelude::*;
use batchmetrics::util::logging;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;

/// Command line arguments for the smoke run
#[derive(Parser, Debug)]
#[command(name = "smoke", about = "Drive the metric reporter with synthetic load")]
struct Args {
    /// Path to a configuration file; defaults are used without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between worker ticks, overriding the configuration
    #[arg(short, long)]
    interval: Option<u64>,

    /// Number of ticks to run before stopping
    #[arg(short, long, default_value = "3")]
    ticks: u32,

    /// Enable the configured environment even if it is not listed
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ReporterConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                logging::init(&LogLevel::Error);
                error!("Failed to load configuration: {:#}", e);
                return Err(e);
            }
        },
        None => ReporterConfig::default(),
    };

    logging::init(&config.log_level);

    if let Some(interval) = args.interval {
        config.interval = interval.max(1);
    }
    if args.force && !config.environment_enabled() {
        config.enabled_environments.push(config.environment.clone());
    }

    let interval = config.interval();
    info!(
        "Smoke run: {} tick(s) every {:?} in environment '{}'",
        args.ticks, interval, config.environment
    );

    let reporter = Reporter::new(config, Arc::new(LogClient::default()));

    let started_at = Instant::now();
    reporter.register_collector(
        "job_queue",
        Arc::new(FnCollector::new("synthetic_queue", move |sink| {
            let latency = started_at.elapsed().as_secs_f64() % 5.0;
            sink.report(
                MetricReport::new("QueueLatency", latency).with_dimension("QueueName", "default"),
            );
            Ok(())
        })),
    );

    // Push-style reports from the application side
    for i in 0..10 {
        reporter.report(MetricReport::new("RequestQueueTime", i as f64 * 1.5));
    }

    if !reporter.started() {
        info!("Reporter did not start; pass --force to enable this environment");
        return Ok(());
    }

    let run_for = interval * args.ticks + Duration::from_millis(500);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt signal, shutting down...");
        }
        _ = tokio::time::sleep(run_for) => {}
    }

    tokio::task::spawn_blocking(move || reporter.stop()).await?;
    info!("Smoke run finished");
    Ok(())
}
