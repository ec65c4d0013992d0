//! Runtime configuration for cag-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All cache-related knobs (directory, compression, fallback bounds) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "cag-cache", about = "Persistent KV-state cache server for LLM inference")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address, overriding the configured one.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Cache storage settings.
    pub cache: CacheConfig,

    /// Generation defaults and fallback tuning.
    pub generation: GenerationConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Model-related settings.
///
/// The model file itself is owned by the external inference engine; these
/// fields identify it for fingerprinting and context-window checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the model file.
    pub model_path: PathBuf,

    /// Context size in tokens.
    pub context_size: usize,

    /// Version tag mixed into the model fingerprint. Bump to invalidate
    /// every existing cache entry for this model path.
    pub version_tag: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            context_size: 32768,
            version_tag: "v1".to_string(),
        }
    }
}

/// Cache storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding state blobs, metadata sidecars and both indexes.
    pub cache_dir: PathBuf,

    /// Apply zstd compression to state blobs on disk.
    pub compress_blobs: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/cag-cache"),
            compress_blobs: true,
            zstd_level: 3,
        }
    }
}

/// Generation defaults and fallback behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Default maximum tokens to generate per request.
    pub default_max_tokens: usize,

    /// Upper bound applied to the requested temperature.
    pub max_temperature: f64,

    /// Maximum characters of the original document injected into the prompt
    /// when a persisted state cannot be restored.
    pub fallback_excerpt_chars: usize,

    /// Capacity of the streaming event channel.
    pub stream_channel_capacity: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 1024,
            max_temperature: 2.0,
            fallback_excerpt_chars: 8000,
            stream_channel_capacity: 32,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Path of the durable cache registry index.
    pub fn registry_path(&self) -> PathBuf {
        self.cache.cache_dir.join("cache_registry.json")
    }

    /// Path of the durable usage index.
    pub fn usage_path(&self) -> PathBuf {
        self.cache.cache_dir.join("usage_registry.json")
    }
}
