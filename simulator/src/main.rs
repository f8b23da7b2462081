mod plant;

use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use monitor::analytics::SensorRef;
use monitor::store::MemoryStore;
use monitor::{Config, Monitor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Drives an in-process monitor with synthetic plant readings.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    /// Samples submitted per second across all sensors
    #[arg(long, env = "RATE", default_value_t = 200)]
    rate: u64,

    /// How long to generate readings
    #[arg(long, env = "DURATION_SECS", default_value_t = 10)]
    duration_secs: u64,

    /// Chance that a reading is drawn outside the normal band
    #[arg(long, env = "OUTLIER_PROBABILITY", default_value_t = 0.02)]
    outlier_probability: f64,

    /// Seed for reproducible runs
    #[arg(long, env = "SEED")]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if !(0.0..=1.0).contains(&args.outlier_probability) {
        error!("Outlier probability must be within [0, 1]");
        std::process::exit(1);
    }

    let config = Config::from_env();
    monitor::metrics::init_metrics();

    let store = Arc::new(MemoryStore::new());
    let monitor = match Monitor::new(&config, store.clone()) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("Failed to build monitor: {}", e);
            std::process::exit(1);
        }
    };

    let (devices, channels) = plant::plant();
    for device in devices {
        if let Err(e) = monitor.registry.register_device(device) {
            error!("Failed to register device: {}", e);
            std::process::exit(1);
        }
    }
    for channel in &channels {
        if let Err(e) = monitor.registry.add_sensor(channel.device_id, channel.sensor.clone()) {
            error!("Failed to add sensor: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = monitor.start().await {
        error!("Failed to start monitor: {}", e);
        std::process::exit(1);
    }

    let started_at = Utc::now();
    info!(
        "Simulating {} sensors at {} samples/s for {}s",
        channels.len(),
        args.rate,
        args.duration_secs
    );

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    const BURST_SIZE: u64 = 20;
    let burst_interval = Duration::from_millis((BURST_SIZE * 1000) / args.rate.max(1));
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut submitted = 0u64;

    while Instant::now() < deadline {
        let burst_start = Instant::now();

        for _ in 0..BURST_SIZE {
            let channel = &channels[rng.gen_range(0..channels.len())];
            let sample = plant::reading(&mut rng, channel, args.outlier_probability);
            match monitor.pipeline.process_sensor_data(sample).await {
                Ok(()) => submitted += 1,
                Err(e) => warn!("Failed to submit sample: {}", e),
            }
        }

        if submitted % 1000 == 0 {
            info!("Submitted {} samples", submitted);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!("Burst took {:?}, target was {:?}", elapsed, burst_interval);
        }
    }

    match monitor.shutdown().await {
        Ok(report) => info!("Final flush forwarded {} samples", report.forwarded),
        Err(e) => error!("Shutdown failed: {}", e),
    }

    info!("Submitted {} samples, {} stored", submitted, store.len());
    print_report(&monitor, &channels, started_at).await;
}

async fn print_report(monitor: &Monitor, channels: &[plant::Channel], started_at: chrono::DateTime<Utc>) {
    let stats = monitor.system_stats();
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => info!("System stats:\n{}", json),
        Err(e) => warn!("Failed to render system stats: {}", e),
    }

    let start = started_at - ChronoDuration::seconds(1);
    let end = Utc::now();
    for channel in channels {
        match monitor
            .analytics
            .analyze_sensor_data(channel.device_id, &channel.sensor.id, start, end)
            .await
        {
            Ok(report) => info!(
                device_id = channel.device_id,
                sensor_id = %channel.sensor.id,
                points = report.data_points,
                mean = report.statistics.mean,
                std_dev = report.statistics.std_dev,
                trend = %report.trend.direction,
                anomalies = report.anomalies.len(),
                "Sensor analysis"
            ),
            Err(e) => warn!(sensor_id = %channel.sensor.id, "Analysis failed: {}", e),
        }
    }

    let temperature = SensorRef {
        device_id: "device_001".to_string(),
        sensor_id: "sensor_001".to_string(),
    };
    let pressure = SensorRef {
        device_id: "device_001".to_string(),
        sensor_id: "sensor_002".to_string(),
    };
    match monitor.analytics.correlation(temperature, pressure, start, end).await {
        Ok(report) => info!(
            points = report.data_points,
            correlation = report.correlation,
            covariance = report.covariance,
            "Temperature/pressure correlation"
        ),
        Err(e) => warn!("Correlation failed: {}", e),
    }
}
