//! # rotating_log
//!
//! Size-rotated JSON-lines file writer. Carries the dedicated
//! future-timestamp rejection stream: one line per dropped packet, so a
//! misbehaving RTC can be traced back to its node without grepping the main
//! log.
//!
//! Write failures are logged and swallowed — a full disk must not stop
//! ingestion.

use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: u32 = 3;

/// One rejection entry in the future-timestamps stream.
#[derive(Debug, Serialize)]
pub struct FutureTimestampEntry<'a> {
    pub node_id: String,
    pub region: &'a str,
    pub sensor_time: i64,
    pub delta_seconds: i64,
}

/// Append-only JSONL file that rolls to `<path>.1`, `<path>.2`, … when it
/// exceeds `max_bytes`. The oldest file is deleted once `max_files` exist.
pub struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
}

impl RotatingLog {
    pub fn new(path: PathBuf, max_bytes: u64, max_files: u32) -> Self {
        Self {
            path,
            max_bytes: max_bytes.max(1024),
            max_files: max_files.max(1),
        }
    }

    pub async fn append<T: Serialize>(&self, entry: &T) {
        let line = match serde_json::to_string(entry) {
            Ok(l) => format!("{l}\n"),
            Err(e) => {
                warn!("rotating log: failed to serialize entry: {e}");
                return;
            }
        };

        self.rotate_if_needed().await;

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!("rotating log: write to {} failed: {e}", self.path.display());
                }
            }
            Err(e) => {
                warn!("rotating log: could not open {}: {e}", self.path.display());
            }
        }
    }

    async fn rotate_if_needed(&self) {
        let size = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => return, // no file yet
        };
        if size < self.max_bytes {
            return;
        }

        // Shift <path>.(n-1) → <path>.n, oldest falls off the end.
        let numbered = |n: u32| PathBuf::from(format!("{}.{n}", self.path.display()));
        let _ = fs::remove_file(numbered(self.max_files)).await;
        for n in (1..self.max_files).rev() {
            let _ = fs::rename(numbered(n), numbered(n + 1)).await;
        }
        if let Err(e) = fs::rename(&self.path, numbered(1)).await {
            warn!("rotating log: rotation of {} failed: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future_timestamps.log");
        let log = RotatingLog::new(path.clone(), DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES);

        log.append(&FutureTimestampEntry {
            node_id: "meshtastic_11223344".to_string(),
            region: "ANZ",
            sensor_time: 2_000_000_000,
            delta_seconds: 3600,
        })
        .await;
        log.append(&json!({"second": true})).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["node_id"], "meshtastic_11223344");
        assert_eq!(first["delta_seconds"], 3600);
    }

    #[tokio::test]
    async fn rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.log");
        // 1024 is the enforced floor for max_bytes
        let log = RotatingLog::new(path.clone(), 1024, 2);

        let filler = "x".repeat(200);
        for _ in 0..10 {
            log.append(&json!({ "filler": &filler })).await;
        }

        assert!(path.exists());
        assert!(PathBuf::from(format!("{}.1", path.display())).exists());
        // Active file stays under the cap plus one entry
        let active = std::fs::metadata(&path).unwrap().len();
        assert!(active < 1024 + 300, "active file too large: {active}");
    }
}
