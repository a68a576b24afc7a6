use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use road_recorder_rs::calibration::CalibrationParameters;
use road_recorder_rs::clock::{ClockConfig, ClockSynchronizer, HttpTimeProvider, MonotonicClock};
use road_recorder_rs::fusion::PipelineEvent;
use road_recorder_rs::sensors;
use road_recorder_rs::session::{CollectionSession, SessionConfig};
use road_recorder_rs::storage::FsStorage;

#[derive(Parser, Debug)]
#[command(name = "road_recorder")]
#[command(about = "Road-surface data collection pipeline", long_about = None)]
struct Args {
    /// Duration in seconds (0 = run until interrupted)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Output directory for session data
    #[arg(long, default_value = "road_recorder_sessions")]
    output_dir: String,

    /// Calibration parameters as a JSON file (defaults when omitted)
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Override the calibrated bump threshold, m/s^2
    #[arg(long)]
    bump_threshold: Option<f64>,

    /// Skip network time synchronization and run on device time
    #[arg(long)]
    no_clock_sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("road recorder starting");
    info!("  duration: {}s (0=continuous)", args.duration);
    info!("  output dir: {}", args.output_dir);

    let mut calibration = match &args.calibration {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            CalibrationParameters::from_json(&value)?
        }
        None => CalibrationParameters::default(),
    };
    if let Some(threshold) = args.bump_threshold {
        calibration.bump_threshold = threshold;
    }
    info!("  bump threshold: {} m/s^2", calibration.bump_threshold);

    let monotonic = MonotonicClock::new();
    let clock = Arc::new(ClockSynchronizer::new(
        Arc::new(HttpTimeProvider::new()),
        ClockConfig::default(),
    ));
    if args.no_clock_sync {
        info!("clock synchronization disabled, using device time");
    } else if let Err(e) = clock.initialize().await {
        warn!("clock synchronization unavailable, using device time: {e}");
    } else {
        info!("clock synchronized: offset {} ms", clock.offset_ms().await?);
    }

    let config = SessionConfig::default();
    let feed_capacity = config.fusion.feed_channel_capacity;
    let session = CollectionSession::new(
        Arc::new(FsStorage::new()),
        Arc::clone(&clock),
        monotonic,
        calibration,
        config,
    )?;
    session
        .recorder()
        .set_error_callback(|message| error!("write failure: {message}"));

    let (accel_tx, accel_rx) = mpsc::channel(feed_capacity);
    let (gyro_tx, gyro_rx) = mpsc::channel(feed_capacity);
    let _accel_handle = tokio::spawn(sensors::accel_loop(accel_tx, monotonic));
    let _gyro_handle = tokio::spawn(sensors::gyro_loop(gyro_tx, monotonic));

    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::BumpDetected { relative_timestamp_ms, magnitude } => {
                    info!("bump at {relative_timestamp_ms} ms, magnitude {magnitude:.2} m/s^2")
                }
                PipelineEvent::FeedError { feed, message } => {
                    warn!("{feed} feed error: {message}")
                }
                PipelineEvent::FeedSilent { feed, silence_secs } => {
                    warn!("{feed} feed silent for {silence_secs:.1}s")
                }
                PipelineEvent::EmissionResumed => info!("emission resumed"),
            }
        }
    });

    let session_dir = PathBuf::from(&args.output_dir)
        .join(format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S")));
    session.start(&session_dir, accel_rx, gyro_rx).await?;
    info!("collecting into {}", session_dir.display());

    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("duration reached, stopping");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                break;
            }
            _ = sleep(Duration::from_secs(5)) => {
                let status = session.status();
                info!(
                    "{} samples, {} rows written, {} bumps",
                    status.processed_samples, status.rows_written, status.bumps_detected
                );
            }
        }
    }

    let summary = session.stop().await?;
    clock.close();

    println!("\n=== Session Summary ===");
    println!("Samples processed: {}", summary.processed_samples);
    println!("Rows written:      {}", summary.rows_written);
    println!("Bumps detected:    {}", summary.bumps_detected);
    if let Some(rate) = summary.sampling_rate_hz {
        println!("Sampling rate:     {rate:.1} Hz");
    }

    Ok(())
}
