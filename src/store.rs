//! On-disk snapshot records, one JSON file per unfinished transfer at
//! `<directory>/.temp/<id>.json`, next to that transfer's segment directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::TransferSpec;
use crate::error::{EngineError, Result};
use crate::segment::Snapshot;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub id: String,
    pub spec: TransferSpec,
    pub snapshot: Snapshot,
    pub saved_at: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn new(id: impl Into<String>, spec: TransferSpec, snapshot: Snapshot) -> Self {
        Self {
            id: id.into(),
            spec,
            snapshot,
            saved_at: Utc::now(),
        }
    }

    pub fn path(&self) -> PathBuf {
        record_path(&self.spec.directory, &self.id)
    }
}

pub fn record_path(directory: &Path, id: &str) -> PathBuf {
    directory.join(".temp").join(format!("{}.json", id))
}

/// Writes the record through a temporary file and a rename, so a crash
/// mid-write leaves the previous record in place.
pub async fn save(record: &SnapshotRecord) -> Result<()> {
    let path = record.path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::io(parent, e))?;
    }

    let content = serde_json::to_vec_pretty(record)
        .map_err(|e| EngineError::InvalidSnapshot(e.to_string()))?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content)
        .await
        .map_err(|e| EngineError::io(&staging, e))?;
    fs::rename(&staging, &path)
        .await
        .map_err(|e| EngineError::io(&path, e))?;
    debug!(transfer = %record.id, downloaded = record.snapshot.downloaded, "snapshot saved");
    Ok(())
}

pub async fn load(path: &Path) -> Result<SnapshotRecord> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| EngineError::InvalidSnapshot(format!("{}: {}", path.display(), e)))
}

/// Every readable record under `directory`, oldest first. Unparseable files
/// are skipped with a warning.
pub async fn list(directory: &Path) -> Result<Vec<SnapshotRecord>> {
    let temp = directory.join(".temp");
    let mut entries = match fs::read_dir(&temp).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::io(&temp, e)),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| EngineError::io(&temp, e))?
    {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        match load(&path).await {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
        }
    }
    records.sort_by_key(|r| r.saved_at);
    Ok(records)
}

/// The most recent record for `url` saved to `filename` under `directory`.
pub async fn find(directory: &Path, url: &str, filename: &str) -> Result<Option<SnapshotRecord>> {
    let records = list(directory).await?;
    Ok(records
        .into_iter()
        .rev()
        .find(|r| r.spec.url == url && r.spec.filename == filename))
}

pub async fn remove(directory: &Path, id: &str) -> Result<()> {
    let path = record_path(directory, id);
    match fs::remove_file(&path).await {
        Ok(()) => {
            debug!(transfer = id, "snapshot removed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io(&path, e)),
    }
}
