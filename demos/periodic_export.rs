// Records from several threads and exports through periodic readers

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use meterline::config::{LogLevel, ReaderConfig, SdkConfig};
use meterline::prelude::*;
use meterline::util::logging;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::time::Duration;

/// Command line arguments for the periodic export demo
#[derive(Parser, Debug)]
#[command(name = "periodic_export", about = "Meterline periodic export demo")]
struct Args {
    /// Path to a TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export interval in milliseconds, used when the configuration has no readers
    #[arg(short, long, default_value = "1000")]
    interval: u64,

    /// How long to record before shutting down, in seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Number of recording threads
    #[arg(short, long, default_value = "4")]
    threads: usize,
}

fn load(args: &Args) -> meterline::error::Result<SdkConfig> {
    let mut config = match &args.config {
        Some(path) => SdkConfig::load(path)?,
        None => SdkConfig::from_env()?,
    };

    if config.readers.is_empty() {
        config.readers.push(ReaderConfig {
            interval_ms: args.interval,
            ..Default::default()
        });
        config.validate()?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load(&args) {
        Ok(config) => {
            logging::init(&config.log_level);
            config
        }
        Err(e) => {
            logging::init(&LogLevel::Error);
            error!("Failed to load configuration: {}", e);
            return Err(anyhow::anyhow!("Failed to load configuration: {}", e));
        }
    };

    let provider = MeterProviderBuilder::from_config(&config, &ExporterRegistry::new())?.build()?;
    info!(
        "Recording for {}s from {} threads into {} readers",
        args.duration,
        args.threads,
        provider.readers().len()
    );

    let meter = provider.meter_with_scope(
        InstrumentationScope::new("periodic_export").with_version(meterline::VERSION),
    );
    let requests = meter
        .counter::<i64>("demo.requests")
        .with_description("Requests handled by worker threads")
        .build();
    let latency = meter
        .histogram::<f64>("demo.latency")
        .with_unit("ms")
        .build();

    let in_flight = Arc::new(AtomicI64::new(0));
    let observed = Arc::clone(&in_flight);
    meter
        .observable_up_down_counter::<i64>("demo.in_flight")
        .with_callback(move |observer| {
            observer.observe(observed.load(Ordering::Relaxed), &[]);
            Ok(())
        })
        .build();

    let deadline = std::time::Instant::now() + Duration::from_secs(args.duration);
    let workers: Vec<_> = (0..args.threads)
        .map(|worker| {
            let requests = requests.clone();
            let latency = latency.clone();
            let in_flight = Arc::clone(&in_flight);
            thread::spawn(move || {
                let route = if worker % 2 == 0 { "/checkout" } else { "/cart" };
                while std::time::Instant::now() < deadline {
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    let elapsed = rand::random::<f64>() * 250.0;
                    thread::sleep(Duration::from_millis(10));
                    requests.add(1, &[KeyValue::new("route", route)]);
                    latency.record(elapsed, &[KeyValue::new("route", route)]);
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for worker in workers {
        if worker.join().is_err() {
            error!("A recording thread panicked");
        }
    }

    info!("Recording finished, shutting down");
    provider.shutdown().await?;
    Ok(())
}
