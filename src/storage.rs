use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::types::ProcessedSample;

/// Fixed column header of the sensor data file. Not negotiable: downstream
/// analysis tooling keys on these names.
pub const SENSOR_CSV_HEADER: &str =
    "timestamp_ms,accel_x,accel_y,accel_z,accel_magnitude,gyro_x,gyro_y,gyro_z,is_bump,user_feedback";

/// File names inside a session directory
pub const SENSOR_DATA_FILE: &str = "sensor_data.csv";
pub const ANNOTATION_LOG_FILE: &str = "annotations.csv";

/// Encode one sample as a CSV row (no trailing newline).
pub fn encode_row(sample: &ProcessedSample) -> String {
    let feedback = sample
        .user_feedback
        .as_deref()
        .map(sanitize_field)
        .unwrap_or_default();
    format!(
        "{},{:.5},{:.5},{:.5},{:.5},{:.5},{:.5},{:.5},{},{}",
        sample.relative_timestamp_ms,
        sample.accel_x,
        sample.accel_y,
        sample.accel_z,
        sample.accel_magnitude,
        sample.gyro_x,
        sample.gyro_y,
        sample.gyro_z,
        sample.is_bump,
        feedback
    )
}

/// Encode a flushed segment as newline-terminated rows, in order.
pub fn encode_rows(samples: &[ProcessedSample]) -> String {
    let mut out = String::with_capacity(samples.len() * 96);
    for sample in samples {
        out.push_str(&encode_row(sample));
        out.push('\n');
    }
    out
}

/// Free-text fields must not break the row structure
fn sanitize_field(value: &str) -> String {
    value.replace([',', '\n', '\r'], " ")
}

/// Durable storage collaborator.
///
/// The pipeline only ever appends: structured rows to the sensor CSV and
/// free-text lines to the annotation log. Directory creation and existence
/// checks support session setup.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn ensure_directory(&self, path: &Path) -> io::Result<()>;

    async fn exists(&self, path: &Path) -> bool;

    /// Append pre-encoded, newline-terminated rows to the sensor data file.
    async fn append_rows(&self, path: &Path, rows: &str) -> io::Result<()>;

    /// Append one line to the annotation log.
    async fn append_log_line(&self, path: &Path, line: &str) -> io::Result<()>;
}

/// Local-filesystem storage
#[derive(Debug, Default, Clone)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }
}

#[async_trait]
impl SessionStorage for FsStorage {
    async fn ensure_directory(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn append_rows(&self, path: &Path, rows: &str) -> io::Result<()> {
        self.append(path, rows.as_bytes()).await
    }

    async fn append_log_line(&self, path: &Path, line: &str) -> io::Result<()> {
        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        data.push('\n');
        self.append(path, data.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64, bump: bool, feedback: Option<&str>) -> ProcessedSample {
        ProcessedSample {
            relative_timestamp_ms: ts,
            accel_x: 0.1,
            accel_y: -0.2,
            accel_z: 9.81,
            accel_magnitude: 9.813,
            gyro_x: 0.01,
            gyro_y: 0.02,
            gyro_z: 0.03,
            is_bump: bump,
            user_feedback: feedback.map(str::to_string),
        }
    }

    #[test]
    fn test_encode_row_layout() {
        let row = encode_row(&sample(120, true, Some("pothole")));
        assert_eq!(
            row,
            "120,0.10000,-0.20000,9.81000,9.81300,0.01000,0.02000,0.03000,true,pothole"
        );
        assert_eq!(row.split(',').count(), SENSOR_CSV_HEADER.split(',').count());
    }

    #[test]
    fn test_encode_row_empty_feedback() {
        let row = encode_row(&sample(0, false, None));
        assert!(row.ends_with(",false,"));
    }

    #[test]
    fn test_encode_row_sanitizes_feedback() {
        let row = encode_row(&sample(0, false, Some("rough,\npatch")));
        assert!(row.ends_with("rough  patch"));
    }

    #[test]
    fn test_encode_rows_preserves_order() {
        let rows = encode_rows(&[sample(10, false, None), sample(20, false, None)]);
        let lines: Vec<&str> = rows.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("10,"));
        assert!(lines[1].starts_with("20,"));
    }

    #[tokio::test]
    async fn test_fs_storage_appends() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new();
        let data_path = dir.path().join(SENSOR_DATA_FILE);

        assert!(!storage.exists(&data_path).await);
        storage
            .append_rows(&data_path, &format!("{SENSOR_CSV_HEADER}\n"))
            .await
            .unwrap();
        storage
            .append_rows(&data_path, &encode_rows(&[sample(5, false, None)]))
            .await
            .unwrap();
        assert!(storage.exists(&data_path).await);

        let contents = std::fs::read_to_string(&data_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], SENSOR_CSV_HEADER);
        assert!(lines[1].starts_with("5,"));
    }

    #[tokio::test]
    async fn test_fs_storage_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new();
        let log_path = dir.path().join(ANNOTATION_LOG_FILE);

        storage.append_log_line(&log_path, "1200,pothole").await.unwrap();
        storage.append_log_line(&log_path, "3400,speed_bump").await.unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents, "1200,pothole\n3400,speed_bump\n");
    }
}
