use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration, Instant};

use crate::fusion::PipelineEvent;

/// Tracks liveness for one raw feed
#[derive(Clone, Debug)]
pub struct FeedHealth {
    pub name: &'static str,
    last_update: Arc<Mutex<Instant>>,
    silence_threshold: Duration,
}

impl FeedHealth {
    pub fn new(name: &'static str, silence_threshold_secs: u64) -> Self {
        FeedHealth {
            name,
            last_update: Arc::new(Mutex::new(Instant::now())),
            silence_threshold: Duration::from_secs(silence_threshold_secs),
        }
    }

    pub fn update(&self) {
        if let Ok(mut time) = self.last_update.lock() {
            *time = Instant::now();
        }
    }

    pub fn time_since_last_update(&self) -> Option<Duration> {
        self.last_update.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        self.time_since_last_update()
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }
}

/// Health state for the accelerometer/gyroscope pair
pub struct PipelineHealth {
    pub accel: FeedHealth,
    pub gyro: FeedHealth,
    check_interval: Duration,
}

impl PipelineHealth {
    pub fn new() -> Self {
        PipelineHealth {
            accel: FeedHealth::new("accel", 5),
            gyro: FeedHealth::new("gyro", 5),
            check_interval: Duration::from_secs(2),
        }
    }

    pub fn check_health(&self) -> HealthReport {
        HealthReport {
            accel_healthy: !self.accel.is_silent(),
            accel_silence: self.accel.time_since_last_update(),
            gyro_healthy: !self.gyro.is_silent(),
            gyro_silence: self.gyro.time_since_last_update(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of feed liveness
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub accel_healthy: bool,
    pub accel_silence: Option<Duration>,
    pub gyro_healthy: bool,
    pub gyro_silence: Option<Duration>,
}

/// Periodic watchdog. The feeds are external collaborators, so a silent feed
/// is reported, not restarted.
pub async fn health_watchdog(
    health: Arc<PipelineHealth>,
    event_tx: broadcast::Sender<PipelineEvent>,
) {
    loop {
        sleep(health.check_interval).await;

        let report = health.check_health();
        for (feed, healthy, silence) in [
            ("accel", report.accel_healthy, report.accel_silence),
            ("gyro", report.gyro_healthy, report.gyro_silence),
        ] {
            if !healthy {
                let silence_secs = silence.unwrap_or(Duration::ZERO).as_secs_f64();
                warn!("{feed} feed silent for {silence_secs:.1}s");
                let _ = event_tx.send(PipelineEvent::FeedSilent { feed, silence_secs });
            }
        }
    }
}
