//! Durable index of cache entries.
//!
//! The registry is the authoritative record of which cache entries exist.
//! It is persisted as human-readable JSON and rewritten whole (temp file +
//! rename) on every mutation, so a crash mid-write cannot corrupt the last
//! consistent state. A registry that fails to parse is reinitialized empty
//! with a warning: losing the index is preferred over refusing to start,
//! since entries can be re-registered by the document processor.
//!
//! Invariants enforced here:
//! - entry ids are unique
//! - at most one entry carries the master flag
//! - every listed entry's blob and sidecar exist on disk at load time;
//!   violating entries are pruned, not silently trusted

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::inference::model::ModelFingerprint;

/// Index format version.
const REGISTRY_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("duplicate cache id: {0}")]
    DuplicateId(String),

    #[error("cache entry not found: {0}")]
    CacheNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode registry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Immutable reference to the document a cache entry was built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Path of the original document.
    pub path: PathBuf,

    /// xxh3 hash of the document content at processing time.
    pub content_hash: u64,

    /// Estimated token count.
    pub token_estimate: usize,
}

/// One persisted cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Unique, stable identifier.
    pub id: String,

    /// The document this state was built from.
    pub document: DocumentRef,

    /// Fingerprint of the model that produced the state.
    pub model_fingerprint: ModelFingerprint,

    /// Path of the state blob file.
    pub blob_path: PathBuf,

    /// Path of the metadata sidecar.
    pub metadata_path: PathBuf,

    /// Blob size on disk in bytes.
    pub size_bytes: u64,

    /// Creation time, unix seconds.
    pub created_at: u64,

    /// Last successful use, unix seconds.
    pub last_used_at: u64,

    /// Number of successful generations served from this entry.
    pub use_count: u64,

    /// Whether this entry is the default when nothing is explicitly selected.
    pub is_master: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// The durable cache index.
pub struct CacheRegistry {
    path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheRegistry {
    /// Load the registry from disk.
    ///
    /// A missing file yields an empty registry. A file that fails to parse or
    /// carries an unknown version is discarded with a warning. Entries whose
    /// blob or sidecar is missing on disk are pruned, and the pruned index is
    /// persisted immediately.
    pub async fn load(path: PathBuf) -> Result<Self, RegistryError> {
        let mut registry = Self {
            path,
            entries: BTreeMap::new(),
        };

        if !registry.path.exists() {
            debug!(path = %registry.path.display(), "No registry file, starting empty");
            return Ok(registry);
        }

        let raw = fs::read_to_string(&registry.path).await?;
        match serde_json::from_str::<RegistryFile>(&raw) {
            Ok(file) if file.version == REGISTRY_VERSION => {
                registry.entries = file.entries;
            }
            Ok(file) => {
                warn!(
                    version = file.version,
                    "Unknown registry version, reinitializing empty index"
                );
            }
            Err(e) => {
                warn!(
                    path = %registry.path.display(),
                    error = %e,
                    "Registry file corrupt, reinitializing empty index"
                );
            }
        }

        // Prune entries whose files vanished (out-of-band deletion, or a
        // crash between the store's two renames).
        let missing: Vec<String> = registry
            .entries
            .values()
            .filter(|e| !e.blob_path.exists() || !e.metadata_path.exists())
            .map(|e| e.id.clone())
            .collect();

        if !missing.is_empty() {
            for id in &missing {
                warn!(id, "Pruning registry entry with missing files");
                registry.entries.remove(id);
            }
            registry.persist().await?;
        }

        info!(
            entries = registry.entries.len(),
            pruned = missing.len(),
            "Cache registry loaded"
        );

        Ok(registry)
    }

    /// Record a new entry. If it carries the master flag, any previous master
    /// is demoted first.
    pub async fn register(&mut self, entry: CacheEntry) -> Result<(), RegistryError> {
        if self.entries.contains_key(&entry.id) {
            return Err(RegistryError::DuplicateId(entry.id));
        }

        if entry.is_master {
            self.clear_master();
        }

        info!(id = %entry.id, master = entry.is_master, "Registered cache entry");
        self.entries.insert(entry.id.clone(), entry);
        self.persist().await
    }

    pub fn get(&self, id: &str) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    /// All entries in id order.
    pub fn list(&self) -> Vec<&CacheEntry> {
        self.entries.values().collect()
    }

    /// The current master entry, if one is designated.
    pub fn master(&self) -> Option<&CacheEntry> {
        self.entries.values().find(|e| e.is_master)
    }

    /// Designate `id` as the master entry, demoting any previous master.
    pub async fn set_master(&mut self, id: &str) -> Result<(), RegistryError> {
        if !self.entries.contains_key(id) {
            return Err(RegistryError::CacheNotFound(id.to_string()));
        }

        self.clear_master();
        if let Some(entry) = self.entries.get_mut(id) {
            entry.is_master = true;
        }

        info!(id, "Master cache set");
        self.persist().await
    }

    /// Remove an entry from the index. Does not touch files; that is the
    /// store's job and the purge manager calls both.
    pub async fn remove(&mut self, id: &str) -> Result<CacheEntry, RegistryError> {
        let entry = self
            .entries
            .remove(id)
            .ok_or_else(|| RegistryError::CacheNotFound(id.to_string()))?;
        self.persist().await?;
        Ok(entry)
    }

    /// Record a successful use of an entry.
    pub async fn touch(&mut self, id: &str, at: u64) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::CacheNotFound(id.to_string()))?;
        entry.use_count += 1;
        entry.last_used_at = at;
        self.persist().await
    }

    /// Drop every entry and persist an empty index.
    pub async fn clear(&mut self) -> Result<(), RegistryError> {
        self.entries.clear();
        self.persist().await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of all registered blobs.
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    fn clear_master(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.is_master {
                debug!(id = %entry.id, "Demoting previous master cache");
                entry.is_master = false;
            }
        }
    }

    /// Rewrite the whole index atomically.
    async fn persist(&self) -> Result<(), RegistryError> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
