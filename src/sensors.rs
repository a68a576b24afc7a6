//! Simulated sensor feeds for the demo binary.
//!
//! Real deployments push their platform's accelerometer/gyroscope events into
//! the same channels; the pipeline only sees `FeedResult` items either way.

use std::f64::consts::PI;

use log::{debug, info};
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tokio::time::{interval, Duration};

use crate::clock::MonotonicClock;
use crate::fusion::FeedResult;
use crate::types::{AccelSample, GyroSample};

pub async fn accel_loop(tx: Sender<FeedResult<AccelSample>>, clock: MonotonicClock) {
    let mut interval = interval(Duration::from_millis(10)); // ~100 Hz
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let sample = simulated_accel(clock.now_ms(), sample_count);
        match tx.try_send(Ok(sample)) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 1000 == 0 {
                    debug!("[accel] {sample_count} samples");
                }
            }
            Err(TrySendError::Closed(_)) => {
                info!("[accel] channel closed after {sample_count} samples");
                break;
            }
            Err(TrySendError::Full(_)) => {
                // Channel full, drop this sample
            }
        }
    }
}

pub async fn gyro_loop(tx: Sender<FeedResult<GyroSample>>, clock: MonotonicClock) {
    let mut interval = interval(Duration::from_millis(20)); // ~50 Hz
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let sample = simulated_gyro(clock.now_ms(), sample_count);
        match tx.try_send(Ok(sample)) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 1000 == 0 {
                    debug!("[gyro] {sample_count} samples");
                }
            }
            Err(TrySendError::Closed(_)) => {
                info!("[gyro] channel closed after {sample_count} samples");
                break;
            }
            Err(TrySendError::Full(_)) => {
                // Channel full, drop this sample
            }
        }
    }
}

fn simulated_accel(timestamp_ms: u64, seq: u64) -> AccelSample {
    let t = seq as f64 * 0.01;
    // Road-texture vibration on top of gravity, with a short bump transient
    // roughly every 15 s; the transient varies sample to sample so it reads
    // as a real spike rather than a stuck value.
    let bump = if seq % 1_500 < 3 {
        8.0 + (seq % 3) as f64 * 0.7
    } else {
        0.0
    };
    AccelSample::new(
        (t * 2.0 * PI).sin() * 0.5,
        (t * 2.0 * PI).cos() * 0.3,
        9.81 + (t * PI).sin() * 0.2 + bump,
        timestamp_ms,
    )
}

fn simulated_gyro(timestamp_ms: u64, seq: u64) -> GyroSample {
    let t = seq as f64 * 0.02;
    GyroSample::new(
        (t * 0.5).sin() * 0.05,
        (t * 0.3).cos() * 0.03,
        (t * 1.0).sin() * 0.1,
        timestamp_ms,
    )
}
