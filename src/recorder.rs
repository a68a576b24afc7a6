use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

use crate::error::{PipelineError, Result};
use crate::storage::{encode_rows, SessionStorage, SENSOR_CSV_HEADER, SENSOR_DATA_FILE};
use crate::types::{ProcessedSample, SessionClockAnchor, WriteResult};

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    /// Buffer length that triggers an automatic flush
    pub flush_high_water_mark: usize,
    /// Bounded write attempts per flushed segment
    pub max_write_attempts: u32,
    /// Linear backoff base between attempts; attempt N waits N × this
    pub retry_backoff_ms: u64,
    /// Consecutive exhausted flushes before failures are flagged persistent
    pub persistent_failure_threshold: u32,
    pub write_result_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_high_water_mark: 150,
            max_write_attempts: 3,
            retry_backoff_ms: 500,
            persistent_failure_threshold: 3,
            write_result_capacity: 64,
        }
    }
}

/// Per-session recorder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Collecting,
    Flushing,
    Stopped,
}

type WriteFailureCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct RecorderInner {
    state: RecorderState,
    buffer: Vec<ProcessedSample>,
    session_dir: Option<PathBuf>,
    data_path: Option<PathBuf>,
    anchor: Option<SessionClockAnchor>,
    total_rows_written: u64,
    total_processed_samples: u64,
    consecutive_exhausted_flushes: u32,
}

/// Buffered persistence controller.
///
/// Samples accumulate in an ordered in-memory buffer; a flush removes the
/// whole buffer and appends it to the session's data file. Flushes on one
/// session are serialized by an async write lock, and the segment is
/// extracted under that lock, so rows land in exact production order.
/// Producers never block on a flush: a fresh buffer keeps accumulating while
/// the previous segment is being written.
///
/// Failed appends are retried with bounded linear backoff; every attempt
/// emits a [`WriteResult`] on the broadcast stream. When retries are
/// exhausted the segment is dropped and the registered error callback fires —
/// after `persistent_failure_threshold` consecutive exhaustions the message
/// flags the failure as persistent so a caller can abort the session.
#[derive(Clone)]
pub struct SessionRecorder {
    storage: Arc<dyn SessionStorage>,
    config: RecorderConfig,
    inner: Arc<Mutex<RecorderInner>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    write_result_tx: broadcast::Sender<WriteResult>,
    failure_callback: Arc<Mutex<Option<WriteFailureCallback>>>,
}

impl SessionRecorder {
    pub fn new(storage: Arc<dyn SessionStorage>, config: RecorderConfig) -> Self {
        let (write_result_tx, _) = broadcast::channel(config.write_result_capacity.max(1));
        Self {
            storage,
            config,
            inner: Arc::new(Mutex::new(RecorderInner {
                state: RecorderState::Idle,
                buffer: Vec::new(),
                session_dir: None,
                data_path: None,
                anchor: None,
                total_rows_written: 0,
                total_processed_samples: 0,
                consecutive_exhausted_flushes: 0,
            })),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            write_result_tx,
            failure_callback: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_session_directory(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let mut inner = self.lock_inner();
        match inner.state {
            RecorderState::Idle | RecorderState::Stopped => {
                let dir = dir.into();
                inner.data_path = Some(dir.join(SENSOR_DATA_FILE));
                inner.session_dir = Some(dir);
                Ok(())
            }
            state => Err(PipelineError::InvalidState(format!(
                "cannot change session directory while {state:?}"
            ))),
        }
    }

    pub fn set_error_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.failure_callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    pub fn subscribe_write_results(&self) -> broadcast::Receiver<WriteResult> {
        self.write_result_tx.subscribe()
    }

    pub fn state(&self) -> RecorderState {
        self.lock_inner().state
    }

    /// Rows durably appended this session. Resets to 0 exactly on `start`.
    pub fn total_rows_written(&self) -> u64 {
        self.lock_inner().total_rows_written
    }

    /// Every sample this session has produced, dropped segments included.
    pub fn total_processed_samples(&self) -> u64 {
        self.lock_inner().total_processed_samples
    }

    /// Flushes in a row that exhausted their retries. Zeroed by any
    /// successful write; a caller can abort the session once this crosses
    /// its own tolerance.
    pub fn consecutive_failed_flushes(&self) -> u32 {
        self.lock_inner().consecutive_exhausted_flushes
    }

    pub fn clock_anchor(&self) -> Option<SessionClockAnchor> {
        self.lock_inner().anchor.clone()
    }

    /// Achieved sampling rate from the sealed anchor. Valid only after stop.
    pub fn calculate_actual_sampling_rate_hz(&self) -> Option<f64> {
        let inner = self.lock_inner();
        if inner.state != RecorderState::Stopped {
            return None;
        }
        let elapsed_ms = inner.anchor.as_ref()?.elapsed_ms()?;
        if elapsed_ms == 0 {
            return None;
        }
        Some(inner.total_processed_samples as f64 / (elapsed_ms as f64 / 1000.0))
    }

    /// Open the session: reset counters, take ownership of the anchor, and
    /// prepare the data file (header is written when the file is new).
    pub async fn start(&self, anchor: SessionClockAnchor) -> Result<()> {
        let (session_dir, data_path) = {
            let mut inner = self.lock_inner();
            match inner.state {
                RecorderState::Idle | RecorderState::Stopped => {}
                _ => return Err(PipelineError::AlreadyRunning),
            }
            let session_dir = inner.session_dir.clone().ok_or_else(|| {
                PipelineError::InvalidState("session directory not set".to_string())
            })?;
            let data_path = inner
                .data_path
                .clone()
                .ok_or_else(|| PipelineError::InvalidState("data path not set".to_string()))?;
            inner.buffer.clear();
            inner.total_rows_written = 0;
            inner.total_processed_samples = 0;
            inner.consecutive_exhausted_flushes = 0;
            inner.anchor = Some(anchor);
            inner.state = RecorderState::Collecting;
            (session_dir, data_path)
        };

        let setup = async {
            self.storage
                .ensure_directory(&session_dir)
                .await
                .map_err(|e| PipelineError::StorageError(e.to_string()))?;
            if !self.storage.exists(&data_path).await {
                self.storage
                    .append_rows(&data_path, &format!("{SENSOR_CSV_HEADER}\n"))
                    .await
                    .map_err(|e| PipelineError::StorageError(e.to_string()))?;
            }
            Ok(())
        };
        if let Err(e) = setup.await {
            self.lock_inner().state = RecorderState::Idle;
            return Err(e);
        }
        info!("recording session started in {}", session_dir.display());
        Ok(())
    }

    /// Append one sample to the buffer, triggering an automatic flush at the
    /// high-water mark. Samples arriving outside a session are discarded.
    pub fn ingest(&self, sample: ProcessedSample) {
        let should_flush = {
            let mut inner = self.lock_inner();
            match inner.state {
                RecorderState::Collecting | RecorderState::Flushing => {}
                _ => return,
            }
            inner.total_processed_samples += 1;
            inner.buffer.push(sample);
            inner.buffer.len() >= self.config.flush_high_water_mark
        };
        if should_flush {
            let recorder = self.clone();
            tokio::spawn(async move {
                let _ = recorder.flush_buffer().await;
            });
        }
    }

    /// Remove the buffered samples and append them to storage. Waits for any
    /// flush already in flight; returns the removed segment (also when its
    /// write ultimately failed — the write-result stream and the error
    /// callback carry the outcome).
    pub async fn flush_buffer(&self) -> Result<Vec<ProcessedSample>> {
        let _guard = self.write_lock.lock().await;

        let (segment, data_path) = {
            let mut inner = self.lock_inner();
            if inner.state == RecorderState::Idle {
                return Err(PipelineError::NotRunning);
            }
            let data_path = inner
                .data_path
                .clone()
                .ok_or_else(|| PipelineError::InvalidState("data path not set".to_string()))?;
            let segment = mem::take(&mut inner.buffer);
            if segment.is_empty() {
                return Ok(segment);
            }
            if inner.state == RecorderState::Collecting {
                inner.state = RecorderState::Flushing;
            }
            (segment, data_path)
        };

        let rows = encode_rows(&segment);
        let mut attempt = 1u32;
        let outcome = loop {
            match self.storage.append_rows(&data_path, &rows).await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        "flush attempt {attempt}/{} failed for {} rows: {message}",
                        self.config.max_write_attempts,
                        segment.len()
                    );
                    let _ = self.write_result_tx.send(WriteResult {
                        success: false,
                        attempt,
                        rows: segment.len(),
                        error: Some(message.clone()),
                    });
                    if attempt >= self.config.max_write_attempts {
                        break Err(message);
                    }
                    sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * attempt as u64,
                    ))
                    .await;
                    attempt += 1;
                }
            }
        };

        match outcome {
            Ok(()) => {
                let _ = self.write_result_tx.send(WriteResult {
                    success: true,
                    attempt,
                    rows: segment.len(),
                    error: None,
                });
                let mut inner = self.lock_inner();
                inner.total_rows_written += segment.len() as u64;
                inner.consecutive_exhausted_flushes = 0;
                if inner.state == RecorderState::Flushing {
                    inner.state = RecorderState::Collecting;
                }
            }
            Err(last_error) => {
                let consecutive = {
                    let mut inner = self.lock_inner();
                    inner.consecutive_exhausted_flushes += 1;
                    if inner.state == RecorderState::Flushing {
                        inner.state = RecorderState::Collecting;
                    }
                    inner.consecutive_exhausted_flushes
                };
                let persistent = consecutive >= self.config.persistent_failure_threshold;
                let message = format!(
                    "dropped {} samples after {attempt} write attempts: {last_error}{}",
                    segment.len(),
                    if persistent { " (persistent storage failure)" } else { "" }
                );
                error!("{message}");
                let callback = self
                    .failure_callback
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(callback) = callback {
                    callback(&message);
                }
            }
        }
        Ok(segment)
    }

    /// Close the session: wait for the in-flight flush, flush the residual
    /// buffer, seal the anchor, and stop accepting samples.
    pub async fn stop(
        &self,
        ntp_end_time: Option<chrono::DateTime<chrono::Utc>>,
        monotonic_end_ms: u64,
    ) -> Result<()> {
        {
            let inner = self.lock_inner();
            match inner.state {
                RecorderState::Collecting | RecorderState::Flushing => {}
                _ => return Err(PipelineError::NotRunning),
            }
        }

        self.flush_buffer().await?;

        let mut inner = self.lock_inner();
        inner.state = RecorderState::Stopped;
        if let Some(anchor) = inner.anchor.as_mut() {
            anchor.seal(ntp_end_time, monotonic_end_ms);
        }
        info!(
            "recording session stopped: {} rows written, {} samples processed",
            inner.total_rows_written, inner.total_processed_samples
        );
        Ok(())
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, RecorderInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockStorage {
        fail_appends: AtomicU32,
        appended: Mutex<String>,
    }

    impl MockStorage {
        fn new(fail_appends: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_appends: AtomicU32::new(fail_appends),
                appended: Mutex::new(String::new()),
            })
        }

        fn contents(&self) -> String {
            self.appended.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionStorage for MockStorage {
        async fn ensure_directory(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        async fn exists(&self, _path: &Path) -> bool {
            !self.appended.lock().unwrap().is_empty()
        }

        async fn append_rows(&self, _path: &Path, rows: &str) -> io::Result<()> {
            let remaining = self.fail_appends.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_appends.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.appended.lock().unwrap().push_str(rows);
            Ok(())
        }

        async fn append_log_line(&self, _path: &Path, line: &str) -> io::Result<()> {
            let mut appended = self.appended.lock().unwrap();
            appended.push_str(line);
            appended.push('\n');
            Ok(())
        }
    }

    fn sample(ts: u64) -> ProcessedSample {
        ProcessedSample {
            relative_timestamp_ms: ts,
            accel_x: 0.0,
            accel_y: 0.0,
            accel_z: 9.81,
            accel_magnitude: 9.81,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
            is_bump: false,
            user_feedback: None,
        }
    }

    fn recorder(storage: Arc<MockStorage>, config: RecorderConfig) -> SessionRecorder {
        let recorder = SessionRecorder::new(storage, config);
        recorder.set_session_directory("/tmp/session").unwrap();
        recorder
    }

    fn fast_config() -> RecorderConfig {
        RecorderConfig { retry_backoff_ms: 1, ..Default::default() }
    }

    #[tokio::test]
    async fn test_flush_returns_ordered_segment_and_empties_buffer() {
        let storage = MockStorage::new(0);
        let recorder = recorder(storage.clone(), fast_config());
        recorder.start(SessionClockAnchor::begin(None, 0)).await.unwrap();

        for ts in [10, 20, 30, 40, 50] {
            recorder.ingest(sample(ts));
        }
        let segment = recorder.flush_buffer().await.unwrap();
        assert_eq!(segment.len(), 5);
        let timestamps: Vec<u64> = segment.iter().map(|s| s.relative_timestamp_ms).collect();
        assert_eq!(timestamps, vec![10, 20, 30, 40, 50]);

        assert!(recorder.flush_buffer().await.unwrap().is_empty());
        assert_eq!(recorder.total_rows_written(), 5);

        let contents = storage.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], SENSOR_CSV_HEADER);
        assert!(lines[1].starts_with("10,"));
        assert!(lines[5].starts_with("50,"));
    }

    #[tokio::test]
    async fn test_retry_then_success_emits_failures_then_one_success() {
        // Header write consumes no failures: start after scripting them
        let storage = MockStorage::new(0);
        let recorder = recorder(storage.clone(), fast_config());
        recorder.start(SessionClockAnchor::begin(None, 0)).await.unwrap();
        storage.fail_appends.store(2, Ordering::SeqCst);

        let mut results = recorder.subscribe_write_results();
        for ts in 0..4 {
            recorder.ingest(sample(ts));
        }
        let segment = recorder.flush_buffer().await.unwrap();
        assert_eq!(segment.len(), 4);

        let first = results.recv().await.unwrap();
        let second = results.recv().await.unwrap();
        let third = results.recv().await.unwrap();
        assert!(!first.success);
        assert_eq!(first.attempt, 1);
        assert!(!second.success);
        assert_eq!(second.attempt, 2);
        assert!(third.success);
        assert_eq!(third.attempt, 3);
        assert_eq!(third.rows, 4);

        // No duplicate or dropped rows
        let contents = storage.contents();
        assert_eq!(contents.lines().filter(|l| l.starts_with("0,")).count(), 1);
        assert_eq!(contents.lines().count(), 1 + 4);
        assert_eq!(recorder.total_rows_written(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_segment_and_fire_callback() {
        let storage = MockStorage::new(0);
        let config = RecorderConfig {
            retry_backoff_ms: 1,
            persistent_failure_threshold: 1,
            ..Default::default()
        };
        let recorder = recorder(storage.clone(), config);
        recorder.start(SessionClockAnchor::begin(None, 0)).await.unwrap();
        storage.fail_appends.store(10, Ordering::SeqCst);

        let reported: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let reported_clone = reported.clone();
        recorder.set_error_callback(move |message| {
            *reported_clone.lock().unwrap() = Some(message.to_string());
        });

        let mut results = recorder.subscribe_write_results();
        for ts in 0..3 {
            recorder.ingest(sample(ts));
        }
        let segment = recorder.flush_buffer().await.unwrap();
        assert_eq!(segment.len(), 3);

        for expected_attempt in 1..=3 {
            let result = results.recv().await.unwrap();
            assert!(!result.success);
            assert_eq!(result.attempt, expected_attempt);
        }

        let message = reported.lock().unwrap().clone().expect("callback fired");
        assert!(message.contains("3 samples"));
        assert!(message.contains("persistent storage failure"));

        // Dropped for durability, still counted for the sampling rate
        assert_eq!(recorder.total_rows_written(), 0);
        assert_eq!(recorder.total_processed_samples(), 3);
        assert_eq!(recorder.consecutive_failed_flushes(), 1);
        assert_eq!(recorder.state(), RecorderState::Collecting);
    }

    #[tokio::test]
    async fn test_high_water_mark_triggers_automatic_flush() {
        let storage = MockStorage::new(0);
        let config = RecorderConfig {
            flush_high_water_mark: 10,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let recorder = recorder(storage.clone(), config);
        recorder.start(SessionClockAnchor::begin(None, 0)).await.unwrap();

        for ts in 0..10 {
            recorder.ingest(sample(ts));
        }
        for _ in 0..50 {
            if recorder.total_rows_written() == 10 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.total_rows_written(), 10);
        assert_eq!(storage.contents().lines().count(), 1 + 10);
    }

    #[tokio::test]
    async fn test_start_resets_session_accounting() {
        let storage = MockStorage::new(0);
        let recorder = recorder(storage.clone(), fast_config());

        recorder.start(SessionClockAnchor::begin(None, 0)).await.unwrap();
        for ts in 0..5 {
            recorder.ingest(sample(ts));
        }
        recorder.stop(None, 1_000).await.unwrap();
        assert_eq!(recorder.total_rows_written(), 5);

        recorder.start(SessionClockAnchor::begin(None, 2_000)).await.unwrap();
        assert_eq!(recorder.total_rows_written(), 0);
        assert_eq!(recorder.total_processed_samples(), 0);
        assert_eq!(recorder.state(), RecorderState::Collecting);
        assert!(!recorder.clock_anchor().unwrap().is_sealed());
    }

    #[tokio::test]
    async fn test_sampling_rate_from_sealed_anchor() {
        let storage = MockStorage::new(0);
        let recorder = recorder(storage.clone(), fast_config());
        recorder.start(SessionClockAnchor::begin(None, 0)).await.unwrap();

        for ts in 0..100 {
            recorder.ingest(sample(ts * 10));
        }
        // Not valid before stop
        assert!(recorder.calculate_actual_sampling_rate_hz().is_none());

        recorder.stop(None, 1_000).await.unwrap();
        let rate = recorder.calculate_actual_sampling_rate_hz().unwrap();
        assert!((rate - 100.0).abs() < 5.0, "rate was {rate}");
    }

    #[tokio::test]
    async fn test_state_transitions_and_guards() {
        let storage = MockStorage::new(0);
        let recorder = recorder(storage.clone(), fast_config());
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(matches!(
            recorder.stop(None, 0).await,
            Err(PipelineError::NotRunning)
        ));

        recorder.start(SessionClockAnchor::begin(None, 0)).await.unwrap();
        assert!(matches!(
            recorder.start(SessionClockAnchor::begin(None, 0)).await,
            Err(PipelineError::AlreadyRunning)
        ));
        assert!(recorder.set_session_directory("/elsewhere").is_err());

        recorder.stop(None, 10).await.unwrap();
        assert_eq!(recorder.state(), RecorderState::Stopped);

        // Samples outside a session are discarded
        recorder.ingest(sample(99));
        assert_eq!(recorder.total_processed_samples(), 0);
    }
}
