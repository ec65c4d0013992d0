//! Active-cache resolution and model-compatibility checking.
//!
//! Resolution order: an explicitly selected id wins, then the designated
//! master entry, then nothing (the query proceeds without document context).
//! A stale explicit selection (entry purged since it was chosen) fails with
//! `CacheNotFound` rather than silently serving freed state.
//!
//! The compatibility check is mandatory before any state load: restoring a
//! state produced by a different model can corrupt generation silently
//! instead of failing loudly.

use thiserror::Error;
use tracing::debug;

use crate::cache::registry::{CacheEntry, CacheRegistry};
use crate::inference::model::ModelFingerprint;

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("cache entry not found: {0}")]
    CacheNotFound(String),

    #[error("cache entry {id} was built for model {entry_fingerprint}, active model is {active_fingerprint}")]
    CacheIncompatible {
        id: String,
        entry_fingerprint: ModelFingerprint,
        active_fingerprint: ModelFingerprint,
    },
}

/// Resolve the active cache entry for a request.
pub fn resolve<'a>(
    explicit: Option<&str>,
    registry: &'a CacheRegistry,
) -> Result<Option<&'a CacheEntry>, SelectorError> {
    if let Some(id) = explicit {
        let entry = registry
            .get(id)
            .ok_or_else(|| SelectorError::CacheNotFound(id.to_string()))?;
        debug!(id, "Resolved explicitly selected cache");
        return Ok(Some(entry));
    }

    if let Some(master) = registry.master() {
        debug!(id = %master.id, "Resolved master cache");
        return Ok(Some(master));
    }

    debug!("No cache selected and no master designated");
    Ok(None)
}

/// Verify an entry was built by the currently active model.
pub fn check_compatibility(
    entry: &CacheEntry,
    active: &ModelFingerprint,
) -> Result<(), SelectorError> {
    if &entry.model_fingerprint != active {
        return Err(SelectorError::CacheIncompatible {
            id: entry.id.clone(),
            entry_fingerprint: entry.model_fingerprint.clone(),
            active_fingerprint: active.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::registry::DocumentRef;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn entry(dir: &std::path::Path, id: &str, master: bool, fp: &str) -> CacheEntry {
        let blob_path = dir.join(format!("{id}.state"));
        let metadata_path = dir.join(format!("{id}.meta.json"));
        std::fs::write(&blob_path, b"blob").unwrap();
        std::fs::write(&metadata_path, b"{}").unwrap();
        CacheEntry {
            id: id.to_string(),
            document: DocumentRef {
                path: PathBuf::from("/docs/d.txt"),
                content_hash: 1,
                token_estimate: 10,
            },
            model_fingerprint: ModelFingerprint::from_raw(fp),
            blob_path,
            metadata_path,
            size_bytes: 4,
            created_at: 0,
            last_used_at: 0,
            use_count: 0,
            is_master: master,
        }
    }

    #[tokio::test]
    async fn test_explicit_selection_wins_over_master() {
        let tmp = TempDir::new().unwrap();
        let mut reg = CacheRegistry::load(tmp.path().join("r.json")).await.unwrap();
        reg.register(entry(tmp.path(), "m", true, "fp")).await.unwrap();
        reg.register(entry(tmp.path(), "x", false, "fp")).await.unwrap();

        let resolved = resolve(Some("x"), &reg).unwrap().unwrap();
        assert_eq!(resolved.id, "x");
    }

    #[tokio::test]
    async fn test_master_used_when_nothing_explicit() {
        let tmp = TempDir::new().unwrap();
        let mut reg = CacheRegistry::load(tmp.path().join("r.json")).await.unwrap();
        reg.register(entry(tmp.path(), "m", true, "fp")).await.unwrap();

        let resolved = resolve(None, &reg).unwrap().unwrap();
        assert_eq!(resolved.id, "m");
    }

    #[tokio::test]
    async fn test_none_when_no_selection_and_no_master() {
        let tmp = TempDir::new().unwrap();
        let reg = CacheRegistry::load(tmp.path().join("r.json")).await.unwrap();
        assert!(resolve(None, &reg).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_explicit_id_fails() {
        let tmp = TempDir::new().unwrap();
        let reg = CacheRegistry::load(tmp.path().join("r.json")).await.unwrap();
        let err = resolve(Some("gone"), &reg).unwrap_err();
        assert!(matches!(err, SelectorError::CacheNotFound(_)));
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_incompatible() {
        let tmp = TempDir::new().unwrap();
        let e = entry(tmp.path(), "a", false, "old-model");
        let active = ModelFingerprint::from_raw("new-model");

        let err = check_compatibility(&e, &active).unwrap_err();
        assert!(matches!(err, SelectorError::CacheIncompatible { .. }));

        let same = ModelFingerprint::from_raw("old-model");
        assert!(check_compatibility(&e, &same).is_ok());
    }
}
