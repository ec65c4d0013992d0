//! Per-entry usage statistics.
//!
//! Usage counts live in their own durable index, separate from the cache
//! registry, so a failure while logging usage can never corrupt the
//! authoritative entry index. Same recovery policy as the registry: a file
//! that fails to parse is reinitialized empty with a warning.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

const USAGE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode usage index: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Usage statistics for one cache entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Number of successful generations served from this entry.
    pub use_count: u64,

    /// Completion time of the most recent one, unix seconds.
    pub last_used_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UsageFile {
    version: u32,
    records: BTreeMap<String, UsageRecord>,
}

/// The durable usage index.
pub struct UsageTracker {
    path: PathBuf,
    records: BTreeMap<String, UsageRecord>,
}

impl UsageTracker {
    /// Load the usage index, reinitializing empty on parse failure.
    pub async fn load(path: PathBuf) -> Result<Self, UsageError> {
        let mut tracker = Self {
            path,
            records: BTreeMap::new(),
        };

        if !tracker.path.exists() {
            return Ok(tracker);
        }

        let raw = fs::read_to_string(&tracker.path).await?;
        match serde_json::from_str::<UsageFile>(&raw) {
            Ok(file) if file.version == USAGE_VERSION => tracker.records = file.records,
            Ok(file) => warn!(
                version = file.version,
                "Unknown usage index version, reinitializing"
            ),
            Err(e) => warn!(
                path = %tracker.path.display(),
                error = %e,
                "Usage index corrupt, reinitializing"
            ),
        }

        Ok(tracker)
    }

    /// Record one successful generation against an entry.
    pub async fn record(&mut self, id: &str, completed_at: u64) -> Result<UsageRecord, UsageError> {
        let record = self.records.entry(id.to_string()).or_default();
        record.use_count += 1;
        record.last_used_at = completed_at;
        let snapshot = record.clone();

        debug!(id, use_count = snapshot.use_count, "Recorded cache use");
        self.persist().await?;
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<&UsageRecord> {
        self.records.get(id)
    }

    /// Forget an entry's usage. Removing an unknown id is not an error.
    pub async fn remove(&mut self, id: &str) -> Result<Option<UsageRecord>, UsageError> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Drop all records and persist an empty index.
    pub async fn clear(&mut self) -> Result<(), UsageError> {
        self.records.clear();
        self.persist().await
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn persist(&self) -> Result<(), UsageError> {
        let file = UsageFile {
            version: USAGE_VERSION,
            records: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
