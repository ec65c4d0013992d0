//! On-disk storage for persisted inference state.
//!
//! Each cache entry is a pair of files: an opaque state blob wrapped in a
//! small envelope (`<id>.state`) and a JSON metadata sidecar
//! (`<id>.meta.json`). Both are written to temporary paths and renamed into
//! place so a reader never observes a half-written file. The payload inside
//! the envelope is produced and consumed by the inference engine; the store
//! never interprets it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::inference::model::ModelFingerprint;

/// Magic bytes at the start of every blob envelope.
pub const ENVELOPE_MAGIC: [u8; 4] = *b"CAGB";

/// Envelope format version.
pub const ENVELOPE_VERSION: u16 = 1;

/// Envelope flag: payload is zstd-compressed.
const FLAG_ZSTD: u8 = 0b0000_0001;

/// Fixed envelope header size: magic(4) + version(2) + flags(1) + reserved(1)
/// + document hash(8) + payload length(8).
const HEADER_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid cache id: {0:?}")]
    InvalidId(String),

    #[error("cache entry not found: {0}")]
    CacheNotFound(String),

    #[error("cache entry corrupt: {0}")]
    CacheCorrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata sidecar persisted next to each state blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarMetadata {
    /// Path of the model the state was produced with.
    pub model_path: PathBuf,

    /// Fingerprint of that model at creation time.
    pub model_fingerprint: ModelFingerprint,

    /// Path of the original document.
    pub document_path: PathBuf,

    /// xxh3 hash of the document content.
    pub document_hash: u64,

    /// Estimated token count of the document.
    pub token_estimate: usize,

    /// Context window the state was built for.
    pub context_size: usize,

    /// Creation time, unix seconds.
    pub created_at: u64,
}

/// Where a stored entry's files ended up.
#[derive(Debug, Clone)]
pub struct StoreLocation {
    /// Path of the blob file.
    pub blob_path: PathBuf,

    /// Path of the metadata sidecar.
    pub metadata_path: PathBuf,

    /// Size of the blob file on disk, after any compression.
    pub size_bytes: u64,
}

/// Disk store for state blobs and their metadata sidecars.
pub struct CacheStore {
    dir: PathBuf,
    compress: bool,
    zstd_level: i32,
}

impl CacheStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub async fn new(dir: PathBuf, compress: bool, zstd_level: i32) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            compress,
            zstd_level,
        })
    }

    /// Path of the blob file for an entry.
    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.state"))
    }

    /// Path of the metadata sidecar for an entry.
    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.meta.json"))
    }

    /// Whether both files of an entry exist on disk.
    pub fn exists(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.blob_path(id).exists() && self.metadata_path(id).exists()
    }

    /// Persist a state blob and its sidecar.
    ///
    /// Both files are staged under a `.tmp` suffix and renamed into place,
    /// blob first. A crash between the two renames leaves an orphan blob that
    /// registry load-time validation prunes.
    pub async fn put(
        &self,
        id: &str,
        payload: &[u8],
        sidecar: &SidecarMetadata,
    ) -> Result<StoreLocation, StoreError> {
        validate_id(id)?;
        let blob_path = self.blob_path(id);
        let metadata_path = self.metadata_path(id);

        let (encoded, flags) = if self.compress {
            let compressed = zstd::encode_all(payload, self.zstd_level)?;
            (compressed, FLAG_ZSTD)
        } else {
            (payload.to_vec(), 0)
        };

        let mut blob = Vec::with_capacity(HEADER_LEN + encoded.len());
        blob.extend_from_slice(&ENVELOPE_MAGIC);
        blob.extend_from_slice(&ENVELOPE_VERSION.to_le_bytes());
        blob.push(flags);
        blob.push(0); // reserved
        blob.extend_from_slice(&sidecar.document_hash.to_le_bytes());
        blob.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        blob.extend_from_slice(&encoded);

        let blob_tmp = blob_path.with_extension("state.tmp");
        fs::write(&blob_tmp, &blob).await?;
        fs::rename(&blob_tmp, &blob_path).await?;

        let meta_json = serde_json::to_string_pretty(sidecar)
            .map_err(|e| StoreError::CacheCorrupt(format!("metadata encode failed: {e}")))?;
        let meta_tmp = metadata_path.with_extension("json.tmp");
        fs::write(&meta_tmp, meta_json).await?;
        fs::rename(&meta_tmp, &metadata_path).await?;

        let size_bytes = blob.len() as u64;

        debug!(
            id,
            blob = %blob_path.display(),
            size = size_bytes,
            compressed = self.compress,
            "Stored cache entry"
        );

        Ok(StoreLocation {
            blob_path,
            metadata_path,
            size_bytes,
        })
    }

    /// Read back the state payload and sidecar for an entry.
    pub async fn get(&self, id: &str) -> Result<(Vec<u8>, SidecarMetadata), StoreError> {
        validate_id(id)?;
        let blob_path = self.blob_path(id);
        let metadata_path = self.metadata_path(id);

        if !blob_path.exists() || !metadata_path.exists() {
            return Err(StoreError::CacheNotFound(id.to_string()));
        }

        let blob = fs::read(&blob_path).await?;
        let payload = decode_envelope(id, &blob)?;

        let meta_raw = fs::read_to_string(&metadata_path).await?;
        let sidecar: SidecarMetadata = serde_json::from_str(&meta_raw)
            .map_err(|e| StoreError::CacheCorrupt(format!("{id}: invalid metadata: {e}")))?;

        debug!(id, size = payload.len(), "Loaded cache entry");

        Ok((payload, sidecar))
    }

    /// Remove both files of an entry. Deleting a non-existent id is not an
    /// error.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        for path in [self.blob_path(id), self.metadata_path(id)] {
            if path.exists() {
                fs::remove_file(&path).await?;
                debug!(id, path = %path.display(), "Deleted cache file");
            }
        }
        Ok(())
    }
}

/// Cache ids become file names under the store directory, so they must never
/// carry path structure. Ids arrive over HTTP percent-decoded; an id like
/// `../victim` would otherwise resolve outside the cache directory.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !id.bytes().all(|b| b == b'.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// Validate the envelope and return the inner payload, decompressed if needed.
fn decode_envelope(id: &str, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
    if blob.len() < HEADER_LEN {
        return Err(StoreError::CacheCorrupt(format!(
            "{id}: blob shorter than envelope header"
        )));
    }
    if blob[0..4] != ENVELOPE_MAGIC {
        return Err(StoreError::CacheCorrupt(format!("{id}: bad envelope magic")));
    }
    let version = u16::from_le_bytes([blob[4], blob[5]]);
    if version != ENVELOPE_VERSION {
        return Err(StoreError::CacheCorrupt(format!(
            "{id}: unsupported envelope version {version}"
        )));
    }
    let flags = blob[6];
    let payload_len = u64::from_le_bytes(
        blob[16..24]
            .try_into()
            .map_err(|_| StoreError::CacheCorrupt(format!("{id}: truncated header")))?,
    ) as usize;

    let payload = &blob[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(StoreError::CacheCorrupt(format!(
            "{id}: payload length {} does not match header {payload_len}",
            payload.len()
        )));
    }

    if flags & FLAG_ZSTD != 0 {
        zstd::decode_all(payload)
            .map_err(|e| StoreError::CacheCorrupt(format!("{id}: decompression failed: {e}")))
    } else {
        Ok(payload.to_vec())
    }
}

/// Document hash recorded in an entry's envelope, without decoding the payload.
pub fn envelope_document_hash(blob: &[u8]) -> Option<u64> {
    if blob.len() < HEADER_LEN || blob[0..4] != ENVELOPE_MAGIC {
        return None;
    }
    blob[8..16].try_into().ok().map(u64::from_le_bytes)
}
