//! Append-only JSONL audit records.
//!
//! Each line is a self-contained entry:
//!
//! ```json
//! {"timestamp":"2024-05-01T10:00:00Z","record":{...}}
//! ```
//!
//! Rotation and retention are left to the operator.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

pub const METRICS_RECORD_FILE: &str = "workflow_metrics.jsonl";
pub const ALERTS_RECORD_FILE: &str = "workflow_alerts.jsonl";

/// One line of a record stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEntry<T> {
    pub timestamp: DateTime<Utc>,
    pub record: T,
}

/// Writes the metrics and alert record streams into a directory.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    dir: PathBuf,
}

impl RecordWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_RECORD_FILE)
    }

    pub fn alerts_path(&self) -> PathBuf {
        self.dir.join(ALERTS_RECORD_FILE)
    }

    /// Appends `records` to the metrics stream.
    pub fn append_metrics<T: Serialize>(
        &self,
        records: &[T],
        timestamp: DateTime<Utc>,
    ) -> Result<(), MonitorError> {
        append(&self.metrics_path(), records, timestamp)
    }

    /// Appends `records` to the alerts stream.
    pub fn append_alerts<T: Serialize>(
        &self,
        records: &[T],
        timestamp: DateTime<Utc>,
    ) -> Result<(), MonitorError> {
        append(&self.alerts_path(), records, timestamp)
    }
}

fn append<T: Serialize>(
    path: &Path,
    records: &[T],
    timestamp: DateTime<Utc>,
) -> Result<(), MonitorError> {
    if records.is_empty() {
        return Ok(());
    }

    let mut buffer = String::new();
    for record in records {
        buffer.push_str(&serde_json::to_string(&RecordEntry { timestamp, record })?);
        buffer.push('\n');
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(buffer.as_bytes())?;
    Ok(())
}

/// Reads every entry of a record stream. Missing files read as empty.
pub fn read_records<T: for<'de> Deserialize<'de>>(
    path: &Path,
) -> Result<Vec<RecordEntry<T>>, MonitorError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(MonitorError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[test]
    fn test_append_is_cumulative() {
        let dir = TempDir::new().expect("tempdir");
        let writer = RecordWriter::new(dir.path().join("records"));
        let now = Utc::now();

        writer
            .append_alerts(&[json!({ "id": "a1" }), json!({ "id": "a2" })], now)
            .unwrap();
        writer.append_alerts(&[json!({ "id": "a3" })], now).unwrap();
        writer.append_metrics::<Value>(&[], now).unwrap();

        let entries: Vec<RecordEntry<Value>> = read_records(&writer.alerts_path()).unwrap();
        let ids: Vec<&str> = entries
            .iter()
            .filter_map(|e| e.record["id"].as_str())
            .collect();
        assert_eq!(ids, ["a1", "a2", "a3"]);
        assert_eq!(entries[0].timestamp, now);
        assert!(!writer.metrics_path().exists());
    }

    #[test]
    fn test_line_shape() {
        let dir = TempDir::new().expect("tempdir");
        let writer = RecordWriter::new(dir.path());
        writer
            .append_metrics(&[json!({ "workflow_id": "w1" })], Utc::now())
            .unwrap();

        let raw = fs::read_to_string(writer.metrics_path()).unwrap();
        let line: Value = serde_json::from_str(raw.trim()).unwrap();
        assert!(line.get("timestamp").is_some());
        assert_eq!(line["record"]["workflow_id"], json!("w1"));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().expect("tempdir");
        let entries: Vec<RecordEntry<Value>> =
            read_records(&dir.path().join("nope.jsonl")).unwrap();
        assert!(entries.is_empty());
    }
}
