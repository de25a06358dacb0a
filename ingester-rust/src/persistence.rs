//! Snapshot file plumbing shared by the position cache, the pending buffer
//! and the geocoder L1 cache. Loads tolerate a missing or corrupt file (warn
//! and start empty); writes are atomic via write-to-temp + rename so a crash
//! mid-write never truncates the previous snapshot.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// Read and parse a JSON snapshot. Missing file → `None` silently; unreadable
/// or unparsable file → warn and `None`.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = match fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no snapshot at {}, starting empty", path.display());
            return None;
        }
        Err(e) => {
            warn!("failed to read {}: {e}, starting empty", path.display());
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("failed to parse {}: {e}, starting empty", path.display());
            None
        }
    }
}

/// Write a snapshot atomically. The temp file lives next to the target so the
/// rename stays on one filesystem.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        write_atomic(&path, "[1, 2, 3]").await.unwrap();
        let loaded: Vec<u32> = load_json(&path).await.unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
        // No temp file left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Vec<u32>> = load_json(&dir.path().join("absent.json")).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let loaded: Option<Vec<u32>> = load_json(&path).await;
        assert!(loaded.is_none());
    }
}
