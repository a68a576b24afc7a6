use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Accelerometer sample from the device feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccelSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Monotonic device timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl AccelSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp_ms: u64) -> Self {
        Self { x, y, z, timestamp_ms }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Gyroscope sample from the device feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GyroSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Monotonic device timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl GyroSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp_ms: u64) -> Self {
        Self { x, y, z, timestamp_ms }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// One corrected, fused sample. Immutable once created; this is the unit of
/// persistence — one CSV row per sample, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSample {
    /// Milliseconds since the session's monotonic start
    pub relative_timestamp_ms: u64,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub accel_magnitude: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    /// Offset-corrected Z-axis rotation rate
    pub gyro_z: f64,
    pub is_bump: bool,
    pub user_feedback: Option<String>,
}

/// Network + monotonic timestamp pair bracketing one recording session.
///
/// Created at collection start, sealed at stop. Owned by whoever runs the
/// session and passed down explicitly — there is no shared global anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClockAnchor {
    /// Network wall-clock time at start, if synchronization was available
    pub ntp_start_time: Option<DateTime<Utc>>,
    pub monotonic_start_ms: u64,
    pub ntp_end_time: Option<DateTime<Utc>>,
    pub monotonic_end_ms: Option<u64>,
}

impl SessionClockAnchor {
    pub fn begin(ntp_start_time: Option<DateTime<Utc>>, monotonic_start_ms: u64) -> Self {
        Self {
            ntp_start_time,
            monotonic_start_ms,
            ntp_end_time: None,
            monotonic_end_ms: None,
        }
    }

    /// Record the end times. A sealed anchor is never reopened.
    pub fn seal(&mut self, ntp_end_time: Option<DateTime<Utc>>, monotonic_end_ms: u64) {
        self.ntp_end_time = ntp_end_time;
        self.monotonic_end_ms = Some(monotonic_end_ms.max(self.monotonic_start_ms));
    }

    pub fn is_sealed(&self) -> bool {
        self.monotonic_end_ms.is_some()
    }

    /// Session duration in milliseconds, available once sealed
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.monotonic_end_ms
            .map(|end| end.saturating_sub(self.monotonic_start_ms))
    }
}

/// Outcome of one flush attempt against storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    /// 1-based attempt number within one flush
    pub attempt: u32,
    /// Number of rows in the segment being written
    pub rows: usize,
    pub error: Option<String>,
}
