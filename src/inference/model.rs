//! Model references and fingerprinting.
//!
//! A cache entry is only valid for the exact model that produced it. The
//! fingerprint is derived from the model's path, file size and a version tag;
//! any of the three changing invalidates every entry recorded against it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of a model used for compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelFingerprint(String);

impl ModelFingerprint {
    /// Wrap an already-computed fingerprint string (tests, deserialization).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the currently selected model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    /// Path of the model file.
    pub path: PathBuf,

    /// Declared context window in tokens.
    pub context_size: usize,

    /// Free-form version tag mixed into the fingerprint.
    pub version_tag: String,
}

impl ModelRef {
    pub fn new(path: PathBuf, context_size: usize, version_tag: String) -> Self {
        Self {
            path,
            context_size,
            version_tag,
        }
    }

    /// Compute the fingerprint from path, file size and version tag.
    ///
    /// Fails if the model file is missing, which callers surface as a fatal
    /// model-load error for the request.
    pub fn fingerprint(&self) -> Result<ModelFingerprint, ModelError> {
        if !self.path.exists() {
            return Err(ModelError::FileNotFound(self.path.clone()));
        }
        let size = std::fs::metadata(&self.path)?.len();

        let mut hasher = Xxh3::new();
        hasher.update(self.path.to_string_lossy().as_bytes());
        hasher.update(&size.to_le_bytes());
        hasher.update(self.version_tag.as_bytes());

        Ok(ModelFingerprint(format!("{:016x}", hasher.digest())))
    }
}

/// xxh3 hash of arbitrary content (used for document hashes).
pub fn content_hash(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

/// Hash a document file on disk.
pub fn hash_file(path: &Path) -> Result<u64, ModelError> {
    if !path.exists() {
        return Err(ModelError::FileNotFound(path.to_path_buf()));
    }
    let data = std::fs::read(path)?;
    Ok(content_hash(&data))
}
