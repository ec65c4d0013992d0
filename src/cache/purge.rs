//! Deletion of cache entries across all three durable stores.
//!
//! A purge must leave the blob, sidecar, registry entry and usage record all
//! gone. Bulk purge keeps going past individual failures and reports them in
//! a final summary; it always finishes by writing an empty registry and an
//! empty usage index.

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::registry::{CacheEntry, CacheRegistry, RegistryError};
use crate::cache::store::{CacheStore, StoreError};
use crate::cache::usage::{UsageError, UsageTracker};

#[derive(Error, Debug)]
pub enum PurgeError {
    #[error("cache entry not found: {0}")]
    CacheNotFound(String),

    #[error("purge incomplete: {failed} of {attempted} entries could not be fully removed")]
    Incomplete { attempted: usize, failed: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// Remove one entry: files first, then the registry entry, then its usage
/// record. Purging the master leaves no master designated.
///
/// An id absent from the registry fails with `CacheNotFound`, but any
/// file-only remnants under that id are still cleaned up best-effort.
pub async fn purge(
    store: &CacheStore,
    registry: &mut CacheRegistry,
    usage: &mut UsageTracker,
    id: &str,
) -> Result<CacheEntry, PurgeError> {
    if registry.get(id).is_none() {
        if let Err(e) = store.delete(id).await {
            warn!(id, error = %e, "Failed to clean up unregistered cache files");
        }
        return Err(PurgeError::CacheNotFound(id.to_string()));
    }

    store.delete(id).await?;
    let entry = registry.remove(id).await?;

    // Usage is advisory; a failure here must not resurrect the entry.
    if let Err(e) = usage.remove(id).await {
        warn!(id, error = %e, "Failed to remove usage record");
    }

    info!(id, was_master = entry.is_master, "Purged cache entry");
    Ok(entry)
}

/// Remove every entry, in registry order.
///
/// Individual failures are logged and counted; the registry and usage index
/// are emptied regardless, so no failed deletion can leave the index
/// claiming an entry still exists.
pub async fn purge_all(
    store: &CacheStore,
    registry: &mut CacheRegistry,
    usage: &mut UsageTracker,
) -> Result<usize, PurgeError> {
    let ids: Vec<String> = registry.list().iter().map(|e| e.id.clone()).collect();
    let attempted = ids.len();
    let mut failed = 0;

    for id in &ids {
        if let Err(e) = store.delete(id).await {
            warn!(id, error = %e, "Failed to delete cache files during bulk purge");
            failed += 1;
        }
    }

    registry.clear().await?;
    usage.clear().await?;

    info!(attempted, failed, "Bulk purge complete");

    if failed > 0 {
        Err(PurgeError::Incomplete { attempted, failed })
    } else {
        Ok(attempted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::registry::DocumentRef;
    use crate::cache::store::SidecarMetadata;
    use crate::inference::model::ModelFingerprint;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    async fn fixture(dir: &Path) -> (CacheStore, CacheRegistry, UsageTracker) {
        let store = CacheStore::new(dir.join("caches"), false, 3).await.unwrap();
        let registry = CacheRegistry::load(dir.join("cache_registry.json"))
            .await
            .unwrap();
        let usage = UsageTracker::load(dir.join("usage_registry.json"))
            .await
            .unwrap();
        (store, registry, usage)
    }

    async fn add_entry(
        store: &CacheStore,
        registry: &mut CacheRegistry,
        id: &str,
        master: bool,
    ) {
        let sidecar = SidecarMetadata {
            model_path: PathBuf::from("/models/m.gguf"),
            model_fingerprint: ModelFingerprint::from_raw("fp"),
            document_path: PathBuf::from("/docs/d.txt"),
            document_hash: 7,
            token_estimate: 50,
            context_size: 4096,
            created_at: 0,
        };
        let loc = store.put(id, b"state-bytes", &sidecar).await.unwrap();
        registry
            .register(CacheEntry {
                id: id.to_string(),
                document: DocumentRef {
                    path: PathBuf::from("/docs/d.txt"),
                    content_hash: 7,
                    token_estimate: 50,
                },
                model_fingerprint: ModelFingerprint::from_raw("fp"),
                blob_path: loc.blob_path,
                metadata_path: loc.metadata_path,
                size_bytes: loc.size_bytes,
                created_at: 0,
                last_used_at: 0,
                use_count: 0,
                is_master: master,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_all_four_artifacts() {
        let tmp = TempDir::new().unwrap();
        let (store, mut registry, mut usage) = fixture(tmp.path()).await;
        add_entry(&store, &mut registry, "a", false).await;
        usage.record("a", 123).await.unwrap();

        purge(&store, &mut registry, &mut usage, "a").await.unwrap();

        assert!(!store.exists("a"));
        assert!(registry.get("a").is_none());
        assert!(usage.get("a").is_none());
        assert!(matches!(
            store.get("a").await.unwrap_err(),
            StoreError::CacheNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_purge_unknown_id_fails_not_found() {
        let tmp = TempDir::new().unwrap();
        let (store, mut registry, mut usage) = fixture(tmp.path()).await;

        let err = purge(&store, &mut registry, &mut usage, "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, PurgeError::CacheNotFound(_)));
    }

    #[tokio::test]
    async fn test_purge_unregistered_remnants_cleaned() {
        let tmp = TempDir::new().unwrap();
        let (store, mut registry, mut usage) = fixture(tmp.path()).await;

        // File-only remnant: present on disk, absent from the registry.
        let sidecar = SidecarMetadata {
            model_path: PathBuf::from("/models/m.gguf"),
            model_fingerprint: ModelFingerprint::from_raw("fp"),
            document_path: PathBuf::from("/docs/d.txt"),
            document_hash: 7,
            token_estimate: 50,
            context_size: 4096,
            created_at: 0,
        };
        store.put("remnant", b"bytes", &sidecar).await.unwrap();

        let err = purge(&store, &mut registry, &mut usage, "remnant")
            .await
            .unwrap_err();
        assert!(matches!(err, PurgeError::CacheNotFound(_)));
        assert!(!store.exists("remnant"));
    }

    #[tokio::test]
    async fn test_purge_traversal_id_cannot_touch_outside_files() {
        let tmp = TempDir::new().unwrap();
        let (store, mut registry, mut usage) = fixture(tmp.path()).await;

        // The best-effort cleanup for unregistered ids must still refuse ids
        // that resolve outside the cache directory.
        let victim = tmp.path().join("victim.state");
        std::fs::write(&victim, b"state").unwrap();

        let err = purge(&store, &mut registry, &mut usage, "../victim")
            .await
            .unwrap_err();
        assert!(matches!(err, PurgeError::CacheNotFound(_)));
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn test_purge_master_leaves_no_master() {
        let tmp = TempDir::new().unwrap();
        let (store, mut registry, mut usage) = fixture(tmp.path()).await;
        add_entry(&store, &mut registry, "a", true).await;
        add_entry(&store, &mut registry, "b", false).await;

        purge(&store, &mut registry, &mut usage, "a").await.unwrap();
        assert!(registry.master().is_none());
    }

    #[tokio::test]
    async fn test_purge_all_empties_both_indexes() {
        let tmp = TempDir::new().unwrap();
        let (store, mut registry, mut usage) = fixture(tmp.path()).await;
        for id in ["a", "b", "c"] {
            add_entry(&store, &mut registry, id, false).await;
            usage.record(id, 1).await.unwrap();
        }

        let purged = purge_all(&store, &mut registry, &mut usage).await.unwrap();
        assert_eq!(purged, 3);
        assert!(registry.is_empty());
        assert!(usage.is_empty());
        for id in ["a", "b", "c"] {
            assert!(!store.exists(id));
        }
    }

    #[tokio::test]
    async fn test_purge_all_on_empty_registry() {
        let tmp = TempDir::new().unwrap();
        let (store, mut registry, mut usage) = fixture(tmp.path()).await;

        let purged = purge_all(&store, &mut registry, &mut usage).await.unwrap();
        assert_eq!(purged, 0);
        assert!(registry.is_empty());
    }
}
