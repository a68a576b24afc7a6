use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::bump::BumpDetector;
use crate::calibration::CalibrationParameters;
use crate::error::Result;
use crate::health::PipelineHealth;
use crate::types::{AccelSample, GyroSample, ProcessedSample};

/// Item type of the raw feed channels. A feed pushes `Err` when the
/// underlying sensor reports failure.
pub type FeedResult<T> = std::result::Result<T, String>;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FusionConfig {
    /// Fusion tick period; 10 ms is the 100 Hz target rate
    pub tick_period_ms: u64,
    /// Magnitude basis: corrected components when true, raw when false.
    /// Read once at engine construction so the basis cannot drift
    /// mid-session.
    pub magnitude_on_corrected: bool,
    pub feed_channel_capacity: usize,
    pub event_channel_capacity: usize,
    pub refractory_period_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 10,
            magnitude_on_corrected: true,
            feed_channel_capacity: 500,
            event_channel_capacity: 64,
            refractory_period_ms: crate::bump::DEFAULT_REFRACTORY_MS,
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Acquisition-side events for downstream display/annotation
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    BumpDetected { relative_timestamp_ms: u64, magnitude: f64 },
    FeedError { feed: &'static str, message: String },
    FeedSilent { feed: &'static str, silence_secs: f64 },
    EmissionResumed,
}

// ─── User feedback ───────────────────────────────────────────────────────────

/// One pending feedback string, attached to the next emitted sample.
#[derive(Clone, Default)]
pub struct FeedbackSlot(Arc<Mutex<Option<String>>>);

impl FeedbackSlot {
    pub fn set(&self, feedback: impl Into<String>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(feedback.into());
        }
    }

    fn take(&self) -> Option<String> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

// ─── The fusion engine ───────────────────────────────────────────────────────

/// Merges the two raw feeds into corrected samples at a fixed rate.
///
/// Sample-and-hold fusion: each tick emits one sample built from the latest
/// value of each feed, skipped while either feed has produced nothing yet.
/// Interpolation is deliberately avoided — the tick period sits at the
/// native sensor rate.
pub struct FusionEngine {
    config: FusionConfig,
    calibration: CalibrationParameters,
    detector: BumpDetector,
    monotonic_start_ms: u64,
    health: Arc<PipelineHealth>,
    feedback: FeedbackSlot,
    last_accel: Option<AccelSample>,
    last_gyro: Option<GyroSample>,
    paused: bool,
}

impl FusionEngine {
    pub fn new(
        config: FusionConfig,
        calibration: CalibrationParameters,
        monotonic_start_ms: u64,
        health: Arc<PipelineHealth>,
    ) -> Result<Self> {
        calibration.validate()?;
        let mut detector = BumpDetector::new();
        detector.initialize(calibration.bump_threshold, config.refractory_period_ms);
        Ok(Self {
            config,
            calibration,
            detector,
            monotonic_start_ms,
            health,
            feedback: FeedbackSlot::default(),
            last_accel: None,
            last_gyro: None,
            paused: false,
        })
    }

    /// Handle for attaching user feedback to the next emitted sample.
    pub fn feedback_slot(&self) -> FeedbackSlot {
        self.feedback.clone()
    }

    /// Tick loop. Exits when a feed channel closes, the sample receiver is
    /// dropped, or the shutdown signal fires.
    pub async fn run(
        mut self,
        mut accel_rx: mpsc::Receiver<FeedResult<AccelSample>>,
        mut gyro_rx: mpsc::Receiver<FeedResult<GyroSample>>,
        sample_tx: mpsc::Sender<ProcessedSample>,
        event_tx: broadcast::Sender<PipelineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = interval(Duration::from_millis(self.config.tick_period_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Some(sample) = self.process_tick() {
                        if sample.is_bump {
                            let _ = event_tx.send(PipelineEvent::BumpDetected {
                                relative_timestamp_ms: sample.relative_timestamp_ms,
                                magnitude: sample.accel_magnitude,
                            });
                        }
                        if sample_tx.send(sample).await.is_err() {
                            break;
                        }
                    }
                }
                item = accel_rx.recv() => match item {
                    Some(Ok(sample)) => self.ingest_accel(sample, &event_tx),
                    Some(Err(message)) => self.feed_error("accel", message, &event_tx),
                    None => break,
                },
                item = gyro_rx.recv() => match item {
                    Some(Ok(sample)) => self.ingest_gyro(sample, &event_tx),
                    Some(Err(message)) => self.feed_error("gyro", message, &event_tx),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One fusion tick. No output while paused, while either feed is empty,
    /// or while the held timestamps predate the session start.
    fn process_tick(&mut self) -> Option<ProcessedSample> {
        if self.paused {
            return None;
        }
        let accel = self.last_accel.clone()?;
        let gyro = self.last_gyro.clone()?;

        // The fused reading is as fresh as its newest contributor
        let device_ts = accel.timestamp_ms.max(gyro.timestamp_ms);
        let relative_ts = device_ts.checked_sub(self.monotonic_start_ms)?;

        let corrected = self.calibration.correct_accel(&accel);
        let accel_magnitude = if self.config.magnitude_on_corrected {
            corrected.norm()
        } else {
            accel.magnitude()
        };
        let gyro_z = self.calibration.correct_gyro_z(gyro.z);
        let is_bump = self.detector.detect(accel_magnitude, relative_ts);

        Some(ProcessedSample {
            relative_timestamp_ms: relative_ts,
            accel_x: corrected.x,
            accel_y: corrected.y,
            accel_z: corrected.z,
            accel_magnitude,
            gyro_x: gyro.x,
            gyro_y: gyro.y,
            gyro_z,
            is_bump,
            user_feedback: self.feedback.take(),
        })
    }

    fn ingest_accel(&mut self, sample: AccelSample, event_tx: &broadcast::Sender<PipelineEvent>) {
        // Out-of-order delivery: keep the newest reading
        if self
            .last_accel
            .as_ref()
            .map_or(false, |held| sample.timestamp_ms < held.timestamp_ms)
        {
            return;
        }
        self.health.accel.update();
        self.last_accel = Some(sample);
        self.resume_if_paused(event_tx);
    }

    fn ingest_gyro(&mut self, sample: GyroSample, event_tx: &broadcast::Sender<PipelineEvent>) {
        if self
            .last_gyro
            .as_ref()
            .map_or(false, |held| sample.timestamp_ms < held.timestamp_ms)
        {
            return;
        }
        self.health.gyro.update();
        self.last_gyro = Some(sample);
        self.resume_if_paused(event_tx);
    }

    fn feed_error(
        &mut self,
        feed: &'static str,
        message: String,
        event_tx: &broadcast::Sender<PipelineEvent>,
    ) {
        warn!("{feed} feed error, pausing emission: {message}");
        self.paused = true;
        let _ = event_tx.send(PipelineEvent::FeedError { feed, message });
    }

    fn resume_if_paused(&mut self, event_tx: &broadcast::Sender<PipelineEvent>) {
        if self.paused {
            info!("feed recovered, resuming emission");
            self.paused = false;
            let _ = event_tx.send(PipelineEvent::EmissionResumed);
        }
    }
}
