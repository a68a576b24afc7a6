use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{PipelineError, Result};

/// Monotonic millisecond clock for the device timestamp domain.
///
/// Created once by the embedding application and handed to the session and
/// the feed producers so every timestamp shares one origin. Explicitly owned;
/// there is no process-wide clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Network time lookup collaborator.
#[async_trait]
pub trait NetworkTimeProvider: Send + Sync {
    /// Query one server, bounded by `timeout`, and return the signed offset
    /// (network − device wall clock) in milliseconds.
    async fn query_offset(&self, server: &str, timeout: Duration) -> anyhow::Result<i64>;
}

#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Primary server first, then ordered fallbacks
    pub servers: Vec<String>,
    pub lookup_timeout: Duration,
    pub resync_interval: Duration,
    /// A cached offset older than this is refreshed before use
    pub staleness_bound: Duration,
    /// `is_synchronized` reports |offset| below this, ms
    pub sync_tolerance_ms: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "https://worldtimeapi.org/api/timezone/Etc/UTC".to_string(),
                "https://worldtimeapi.org/api/ip".to_string(),
            ],
            lookup_timeout: Duration::from_secs(5),
            resync_interval: Duration::from_secs(600),
            staleness_bound: Duration::from_secs(3600),
            sync_tolerance_ms: 50,
        }
    }
}

/// HTTP time-API provider. Offsets are taken against the round-trip
/// midpoint to split the request latency evenly.
#[derive(Debug, Clone)]
pub struct HttpTimeProvider {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TimeApiResponse {
    unixtime: i64,
}

impl HttpTimeProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkTimeProvider for HttpTimeProvider {
    async fn query_offset(&self, server: &str, timeout: Duration) -> anyhow::Result<i64> {
        let lookup = async {
            let sent_at = Utc::now().timestamp_millis();
            let response = self.client.get(server).send().await?.error_for_status()?;
            let body: TimeApiResponse = response.json().await?;
            let received_at = Utc::now().timestamp_millis();
            let midpoint = sent_at + (received_at - sent_at) / 2;
            anyhow::Ok(body.unixtime * 1000 - midpoint)
        };
        tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| anyhow::anyhow!("time lookup against {server} timed out"))?
    }
}

#[derive(Debug, Default)]
struct OffsetState {
    offset_ms: Option<i64>,
    fetched_at: Option<Instant>,
}

/// Shared between the synchronizer handle and its background resync task
struct SyncCore {
    config: ClockConfig,
    provider: Arc<dyn NetworkTimeProvider>,
    state: Mutex<OffsetState>,
    lookup_in_flight: AtomicBool,
}

impl SyncCore {
    /// Walk the server list until one lookup succeeds. Returns whether a new
    /// offset was cached. A lookup already in flight coalesces: this call
    /// returns without querying.
    async fn refresh(&self) -> bool {
        if self
            .lookup_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let mut updated = false;
        for server in &self.config.servers {
            match self
                .provider
                .query_offset(server, self.config.lookup_timeout)
                .await
            {
                Ok(offset_ms) => {
                    debug!("network time offset {offset_ms} ms via {server}");
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.offset_ms = Some(offset_ms);
                    state.fetched_at = Some(Instant::now());
                    updated = true;
                    break;
                }
                Err(e) => warn!("time lookup against {server} failed: {e}"),
            }
        }
        if !updated {
            warn!("all time servers unreachable, retaining previous offset");
        }

        self.lookup_in_flight.store(false, Ordering::SeqCst);
        updated
    }

    fn cached_offset(&self) -> Option<i64> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).offset_ms
    }
}

/// Maintains the estimated offset between the device clock and network time.
///
/// The offset is looked up once at `initialize`, refreshed by a background
/// task every `resync_interval`, and refreshed on demand when a reader finds
/// it older than `staleness_bound`. When every server fails the previous
/// offset is retained; the only fatal case is a session that never obtained
/// an offset at all — the caller then falls back to device time and records
/// an audit warning.
pub struct ClockSynchronizer {
    core: Arc<SyncCore>,
    resync_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClockSynchronizer {
    pub fn new(provider: Arc<dyn NetworkTimeProvider>, config: ClockConfig) -> Self {
        Self {
            core: Arc::new(SyncCore {
                config,
                provider,
                state: Mutex::new(OffsetState::default()),
                lookup_in_flight: AtomicBool::new(false),
            }),
            resync_task: Mutex::new(None),
        }
    }

    /// First offset lookup plus the periodic resync task.
    ///
    /// Errors only when the lookup failed and no offset has ever been
    /// obtained. The resync task is spawned either way so a later lookup can
    /// still recover synchronization.
    pub async fn initialize(&self) -> Result<()> {
        self.core.refresh().await;

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(core.config.resync_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                core.refresh().await;
            }
        });
        if let Some(old) = self.resync_task.lock().unwrap_or_else(|e| e.into_inner()).replace(handle) {
            old.abort();
        }

        if self.core.cached_offset().is_none() {
            return Err(PipelineError::SyncFailed(
                "no network time server reachable and no prior offset".to_string(),
            ));
        }
        Ok(())
    }

    /// Signed millisecond offset (network − device), refreshing a stale
    /// cache first. Errors only when no offset has ever been obtained.
    pub async fn offset_ms(&self) -> Result<i64> {
        let (cached, fresh) = {
            let state = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
            let fresh = state
                .fetched_at
                .map(|at| at.elapsed() < self.core.config.staleness_bound)
                .unwrap_or(false);
            (state.offset_ms, fresh)
        };
        if let (Some(offset), true) = (cached, fresh) {
            return Ok(offset);
        }

        self.core.refresh().await;
        self.core.cached_offset().ok_or_else(|| {
            PipelineError::SyncFailed("no network time offset has ever been obtained".to_string())
        })
    }

    pub async fn current_network_time(&self) -> Result<DateTime<Utc>> {
        let offset = self.offset_ms().await?;
        Ok(Utc::now() + chrono::Duration::milliseconds(offset))
    }

    /// Translate a device wall-clock timestamp using the cached offset.
    pub fn device_timestamp_to_network(&self, device_ms: i64) -> Option<i64> {
        self.core.cached_offset().map(|offset| device_ms + offset)
    }

    pub fn is_synchronized(&self) -> bool {
        self.core
            .cached_offset()
            .map(|offset| offset.abs() < self.core.config.sync_tolerance_ms)
            .unwrap_or(false)
    }

    /// Stop the periodic resync task. Called on session teardown.
    pub fn close(&self) {
        if let Some(handle) = self.resync_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Drop for ClockSynchronizer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<std::result::Result<i64, String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<std::result::Result<i64, String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetworkTimeProvider for ScriptedProvider {
        async fn query_offset(&self, server: &str, _timeout: Duration) -> anyhow::Result<i64> {
            self.calls.lock().unwrap().push(server.to_string());
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(offset)) => Ok(offset),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Err(anyhow::anyhow!("unreachable")),
            }
        }
    }

    fn config(servers: &[&str]) -> ClockConfig {
        ClockConfig {
            servers: servers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_errors_with_no_offset_ever() {
        let provider = ScriptedProvider::new(vec![Err("down".into()), Err("down".into())]);
        let sync = Arc::new(ClockSynchronizer::new(provider, config(&["a", "b"])));
        assert!(matches!(
            sync.initialize().await,
            Err(PipelineError::SyncFailed(_))
        ));
        assert!(!sync.is_synchronized());
    }

    #[tokio::test]
    async fn test_fallback_server_order() {
        let provider = ScriptedProvider::new(vec![Err("down".into()), Ok(30)]);
        let sync = Arc::new(ClockSynchronizer::new(provider.clone(), config(&["primary", "fallback"])));
        sync.initialize().await.unwrap();

        assert_eq!(provider.calls(), vec!["primary", "fallback"]);
        assert_eq!(sync.offset_ms().await.unwrap(), 30);
        assert!(sync.is_synchronized());
    }

    #[tokio::test]
    async fn test_stale_refresh_retains_previous_offset_on_failure() {
        let provider = ScriptedProvider::new(vec![Ok(42)]);
        let mut cfg = config(&["a"]);
        // Force every read to attempt a refresh
        cfg.staleness_bound = Duration::ZERO;
        let sync = Arc::new(ClockSynchronizer::new(provider, cfg));
        sync.initialize().await.unwrap();

        // Scripted responses are exhausted: the refresh fails, the cached
        // offset degrades gracefully.
        assert_eq!(sync.offset_ms().await.unwrap(), 42);
        assert_eq!(sync.device_timestamp_to_network(1_000), Some(1_042));
    }

    #[tokio::test]
    async fn test_tolerance_bound() {
        let provider = ScriptedProvider::new(vec![Ok(120)]);
        let sync = Arc::new(ClockSynchronizer::new(provider, config(&["a"])));
        sync.initialize().await.unwrap();
        // Offset obtained but outside the 50 ms tolerance
        assert!(!sync.is_synchronized());
        assert_eq!(sync.offset_ms().await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_network_time_applies_offset() {
        let provider = ScriptedProvider::new(vec![Ok(0)]);
        let sync = Arc::new(ClockSynchronizer::new(provider, config(&["a"])));
        sync.initialize().await.unwrap();

        let before = Utc::now();
        let network = sync.current_network_time().await.unwrap();
        assert!((network - before).num_milliseconds().abs() < 1_000);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
