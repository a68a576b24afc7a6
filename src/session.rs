use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::calibration::CalibrationParameters;
use crate::clock::{ClockSynchronizer, MonotonicClock};
use crate::error::{PipelineError, Result};
use crate::fusion::{FeedResult, FeedbackSlot, FusionConfig, FusionEngine, PipelineEvent};
use crate::health::{health_watchdog, PipelineHealth};
use crate::recorder::{RecorderConfig, SessionRecorder};
use crate::storage::{SessionStorage, ANNOTATION_LOG_FILE};
use crate::types::{AccelSample, GyroSample, ProcessedSample, SessionClockAnchor};

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub fusion: FusionConfig,
    pub recorder: RecorderConfig,
}

/// Session-level aggregates reported at stop
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub rows_written: u64,
    pub processed_samples: u64,
    pub bumps_detected: u64,
    pub sampling_rate_hz: Option<f64>,
    pub anchor: Option<SessionClockAnchor>,
}

/// Serializable point-in-time snapshot of a running session
#[derive(Serialize, Deserialize, Clone)]
pub struct SessionStatus {
    pub timestamp: f64,
    pub active: bool,
    pub processed_samples: u64,
    pub rows_written: u64,
    pub bumps_detected: u64,
    pub accel_healthy: bool,
    pub gyro_healthy: bool,
    pub clock_synchronized: bool,
    pub uptime_seconds: u64,
}

impl SessionStatus {
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

struct ActiveSession {
    shutdown_tx: watch::Sender<bool>,
    fusion_handle: JoinHandle<()>,
    forward_handle: JoinHandle<()>,
    health_handle: JoinHandle<()>,
    feedback: FeedbackSlot,
    annotation_path: PathBuf,
    start_monotonic_ms: u64,
}

/// One bounded recording interval: calibration snapshot, clock anchor, and
/// storage target, with the fusion engine and recorder wired between the raw
/// feeds and the session directory.
///
/// `stop` is the graceful path — it lets the in-flight flush finish, flushes
/// the residual buffer, and seals the anchor. Dropping a running session
/// aborts its tasks without that final flush.
pub struct CollectionSession {
    storage: Arc<dyn SessionStorage>,
    clock: Arc<ClockSynchronizer>,
    monotonic: MonotonicClock,
    calibration: CalibrationParameters,
    config: SessionConfig,
    recorder: SessionRecorder,
    health: Arc<PipelineHealth>,
    event_tx: broadcast::Sender<PipelineEvent>,
    sample_observers: broadcast::Sender<ProcessedSample>,
    bumps_detected: Arc<AtomicU64>,
    active: Mutex<Option<ActiveSession>>,
}

impl CollectionSession {
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        clock: Arc<ClockSynchronizer>,
        monotonic: MonotonicClock,
        calibration: CalibrationParameters,
        config: SessionConfig,
    ) -> Result<Self> {
        calibration.validate()?;
        let recorder = SessionRecorder::new(Arc::clone(&storage), config.recorder.clone());
        let (event_tx, _) = broadcast::channel(config.fusion.event_channel_capacity.max(1));
        let (sample_observers, _) = broadcast::channel(config.fusion.feed_channel_capacity.max(1));
        Ok(Self {
            storage,
            clock,
            monotonic,
            calibration,
            config,
            recorder,
            health: Arc::new(PipelineHealth::new()),
            event_tx,
            sample_observers,
            bumps_detected: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        })
    }

    /// Processed-sample stream for downstream display/annotation.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<ProcessedSample> {
        self.sample_observers.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// The persistence controller, for write-result subscription, the
    /// error callback, and session counters.
    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn is_active(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Begin collecting from the given raw feeds into `session_dir`.
    pub async fn start(
        &self,
        session_dir: impl Into<PathBuf>,
        accel_rx: mpsc::Receiver<FeedResult<AccelSample>>,
        gyro_rx: mpsc::Receiver<FeedResult<GyroSample>>,
    ) -> Result<()> {
        if self.lock_active().is_some() {
            return Err(PipelineError::AlreadyRunning);
        }
        let session_dir = session_dir.into();

        // Hybrid clock anchor: network wall time when available, device time
        // otherwise, with an audit line so the degradation is visible later.
        let ntp_start = match self.clock.current_network_time().await {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("starting session on device time only: {e}");
                None
            }
        };
        let start_monotonic_ms = self.monotonic.now_ms();
        let anchor = SessionClockAnchor::begin(ntp_start, start_monotonic_ms);

        self.recorder.set_session_directory(&session_dir)?;
        self.recorder.start(anchor).await?;

        let annotation_path = session_dir.join(ANNOTATION_LOG_FILE);
        if ntp_start.is_none() {
            if let Err(e) = self
                .storage
                .append_log_line(&annotation_path, "0,clock_sync_unavailable")
                .await
            {
                warn!("failed to record clock audit line: {e}");
            }
        }

        let engine = match FusionEngine::new(
            self.config.fusion.clone(),
            self.calibration.clone(),
            start_monotonic_ms,
            Arc::clone(&self.health),
        ) {
            Ok(engine) => engine,
            Err(e) => {
                let _ = self.recorder.stop(None, self.monotonic.now_ms()).await;
                return Err(e);
            }
        };
        let feedback = engine.feedback_slot();

        let (sample_tx, mut sample_rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let fusion_handle = tokio::spawn(engine.run(
            accel_rx,
            gyro_rx,
            sample_tx,
            self.event_tx.clone(),
            shutdown_rx,
        ));

        self.bumps_detected.store(0, Ordering::Relaxed);
        let recorder = self.recorder.clone();
        let observers = self.sample_observers.clone();
        let bumps = Arc::clone(&self.bumps_detected);
        let forward_handle = tokio::spawn(async move {
            while let Some(sample) = sample_rx.recv().await {
                if sample.is_bump {
                    bumps.fetch_add(1, Ordering::Relaxed);
                }
                let _ = observers.send(sample.clone());
                recorder.ingest(sample);
            }
        });

        let health_handle = tokio::spawn(health_watchdog(
            Arc::clone(&self.health),
            self.event_tx.clone(),
        ));

        *self.lock_active() = Some(ActiveSession {
            shutdown_tx,
            fusion_handle,
            forward_handle,
            health_handle,
            feedback,
            annotation_path,
            start_monotonic_ms,
        });
        Ok(())
    }

    /// End the session: drain the pipeline, final-flush, seal the anchor.
    pub async fn stop(&self) -> Result<SessionSummary> {
        let active = self
            .lock_active()
            .take()
            .ok_or(PipelineError::NotRunning)?;

        let _ = active.shutdown_tx.send(true);
        // Fusion exit drops the sample sender; the forward task drains what
        // is left before finishing, so nothing produced is lost here.
        let _ = active.fusion_handle.await;
        let _ = active.forward_handle.await;
        active.health_handle.abort();

        let ntp_end = self.clock.current_network_time().await.ok();
        self.recorder.stop(ntp_end, self.monotonic.now_ms()).await?;

        Ok(SessionSummary {
            rows_written: self.recorder.total_rows_written(),
            processed_samples: self.recorder.total_processed_samples(),
            bumps_detected: self.bumps_detected.load(Ordering::Relaxed),
            sampling_rate_hz: self.recorder.calculate_actual_sampling_rate_hz(),
            anchor: self.recorder.clock_anchor(),
        })
    }

    /// Append to the annotation log and tag the next emitted sample.
    pub async fn record_user_feedback(&self, feedback_type: &str) -> Result<()> {
        let (annotation_path, feedback, start_ms) = {
            let active = self.lock_active();
            let active = active.as_ref().ok_or(PipelineError::NotRunning)?;
            (
                active.annotation_path.clone(),
                active.feedback.clone(),
                active.start_monotonic_ms,
            )
        };

        feedback.set(feedback_type);
        let relative_ms = self.monotonic.now_ms().saturating_sub(start_ms);
        self.storage
            .append_log_line(&annotation_path, &format!("{relative_ms},{feedback_type}"))
            .await
            .map_err(|e| PipelineError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        let (active, uptime_seconds) = {
            let guard = self.lock_active();
            let uptime = guard
                .as_ref()
                .map(|a| self.monotonic.now_ms().saturating_sub(a.start_monotonic_ms) / 1000)
                .unwrap_or(0);
            (guard.is_some(), uptime)
        };
        let report = self.health.check_health();
        SessionStatus {
            timestamp: unix_timestamp(),
            active,
            processed_samples: self.recorder.total_processed_samples(),
            rows_written: self.recorder.total_rows_written(),
            bumps_detected: self.bumps_detected.load(Ordering::Relaxed),
            accel_healthy: report.accel_healthy,
            gyro_healthy: report.gyro_healthy,
            clock_synchronized: self.clock.is_synchronized(),
            uptime_seconds,
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for CollectionSession {
    fn drop(&mut self) {
        if let Some(active) = self.lock_active().take() {
            active.fusion_handle.abort();
            active.forward_handle.abort();
            active.health_handle.abort();
        }
    }
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
