//! Generation orchestration.
//!
//! The engine drives one request at a time through the request lifecycle:
//!
//! ```text
//! Idle → ResourceAcquired → {StateLoaded | NoCache | FallbackPrepared}
//!      → Generating → Streaming → {Completed | Failed | Cancelled} → Idle
//! ```
//!
//! The loaded model plus its restored state is a single-writer resource: a
//! one-permit semaphore is try-acquired up front and the owned permit moves
//! into the worker task, so the resource is released on every exit path and
//! a concurrent caller is rejected with `Busy` instead of queued.
//!
//! A cache that cannot be loaded never aborts the request: the worker falls
//! back to injecting a bounded excerpt of the original document into the
//! prompt and surfaces the degradation as a warning event in the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::registry::{CacheEntry, CacheRegistry};
use crate::cache::selector::{self, SelectorError};
use crate::cache::store::CacheStore;
use crate::cache::unix_now;
use crate::cache::usage::UsageTracker;
use crate::config::GenerationConfig;
use crate::inference::backend::InferenceBackend;
use crate::inference::model::ModelRef;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("generation already in flight")]
    Busy,

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// Lifecycle phase of a request, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ResourceAcquired,
    StateLoaded,
    NoCache,
    FallbackPrepared,
    Generating,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// A generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID.
    pub request_id: String,

    /// The user's query.
    pub query: String,

    /// Explicitly selected cache entry, if any. When `None` the master
    /// entry is used, and failing that the query runs without context.
    pub cache_id: Option<String>,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Sampling temperature, clamped to the configured bound.
    pub temperature: f64,
}

/// Streamed output increments, delivered in generation order.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A new token was generated.
    Token { index: usize, text: String },

    /// Non-fatal degradation the caller must be able to observe, e.g. the
    /// cache failed to load and the request fell back to document injection.
    Warning { message: String },

    /// Generation finished normally.
    Done {
        completion_tokens: usize,
        /// Id of the entry whose state served the request, if any.
        used_cache: Option<String>,
        /// Whether the request ran in fallback mode.
        fallback: bool,
    },

    /// Generation was cancelled cooperatively.
    Cancelled { completion_tokens: usize },

    /// Generation failed after the stream started.
    Error(String),
}

/// The generation orchestrator.
pub struct GenerationEngine {
    backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
    store: Arc<CacheStore>,
    registry: Arc<RwLock<CacheRegistry>>,
    usage: Arc<RwLock<UsageTracker>>,
    model: ModelRef,
    config: GenerationConfig,
    slot: Arc<Semaphore>,
    cancel: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl GenerationEngine {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        store: Arc<CacheStore>,
        registry: Arc<RwLock<CacheRegistry>>,
        usage: Arc<RwLock<UsageTracker>>,
        model: ModelRef,
        config: GenerationConfig,
    ) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            store,
            registry,
            usage,
            model,
            config,
            slot: Arc::new(Semaphore::new(1)),
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a generation request, streaming events to the returned receiver.
    ///
    /// Fails fast, before any state is touched, when the resource is busy,
    /// the model cannot be fingerprinted, the selected entry is unknown, or
    /// its fingerprint does not match the active model.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<GenerationEvent>, EngineError> {
        let permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::Busy)?;

        debug!(request_id = %request.request_id, phase = ?Phase::ResourceAcquired, "Acquired inference resource");

        // A missing or unreadable model file is fatal to the request.
        let active_fingerprint = self
            .model
            .fingerprint()
            .map_err(|e| EngineError::ModelLoadFailed(e.to_string()))?;

        // Resolve and compatibility-check before spawning: a mismatched
        // cache must never reach a state load.
        let selection: Option<CacheEntry> = {
            let registry = self.registry.read().await;
            match selector::resolve(request.cache_id.as_deref(), &registry)? {
                Some(entry) => {
                    selector::check_compatibility(entry, &active_fingerprint)?;
                    Some(entry.clone())
                }
                None => None,
            }
        };

        let cancel_flag = Arc::new(AtomicBool::new(false));
        *self.cancel.lock().await = Some(cancel_flag.clone());

        let (tx, rx) = mpsc::channel(self.config.stream_channel_capacity);

        let worker = Worker {
            backend: self.backend.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            usage: self.usage.clone(),
            config: self.config.clone(),
            cancel_slot: self.cancel.clone(),
            cancel: cancel_flag,
        };

        tokio::spawn(async move {
            worker.run(permit, request, selection, tx).await;
        });

        Ok(rx)
    }

    /// Request cooperative cancellation of the in-flight generation.
    ///
    /// Returns whether a request was in flight. Checked at token boundaries;
    /// once token evaluation has started, cancellation only stops further
    /// token production.
    pub async fn cancel(&self) -> bool {
        match self.cancel.lock().await.as_ref() {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                info!("Cancellation requested");
                true
            }
            None => false,
        }
    }
}

/// Per-request worker state, moved onto the spawned task.
struct Worker {
    backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
    store: Arc<CacheStore>,
    registry: Arc<RwLock<CacheRegistry>>,
    usage: Arc<RwLock<UsageTracker>>,
    config: GenerationConfig,
    cancel_slot: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        self,
        permit: OwnedSemaphorePermit,
        request: GenerationRequest,
        selection: Option<CacheEntry>,
        tx: mpsc::Sender<GenerationEvent>,
    ) {
        // Held for the whole request; dropping it on any path below returns
        // the engine to Idle.
        let _permit = permit;

        let phase = self.run_inner(&request, selection, &tx).await;

        info!(request_id = %request.request_id, phase = ?phase, "Request finished");
        *self.cancel_slot.lock().await = None;
    }

    async fn run_inner(
        &self,
        request: &GenerationRequest,
        selection: Option<CacheEntry>,
        tx: &mpsc::Sender<GenerationEvent>,
    ) -> Phase {
        let mut backend = self.backend.lock().await;

        // ── State load / fallback ─────────────────────────────────────────
        let prompt;
        let mut used_cache = None;
        let mut fallback = false;

        let phase = match &selection {
            Some(entry) => {
                let load_result = match self.store.get(&entry.id).await {
                    Ok((blob, _sidecar)) => backend
                        .restore_state(&blob)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };

                match load_result {
                    Ok(()) => {
                        debug!(request_id = %request.request_id, id = %entry.id, "Cache state restored");
                        used_cache = Some(entry.id.clone());
                        prompt = format!("\n\nQuestion: {}\n\nAnswer: ", request.query);
                        Phase::StateLoaded
                    }
                    Err(cause) => {
                        warn!(
                            request_id = %request.request_id,
                            id = %entry.id,
                            cause,
                            "Cache load failed, falling back to document injection"
                        );
                        backend.reset();
                        prompt = self.fallback_prompt(entry, &request.query).await;
                        fallback = true;

                        let message = format!(
                            "cache '{}' could not be loaded ({cause}); answering from a document excerpt instead",
                            entry.id
                        );
                        if tx.send(GenerationEvent::Warning { message }).await.is_err() {
                            return Phase::Cancelled;
                        }
                        Phase::FallbackPrepared
                    }
                }
            }
            None => {
                backend.reset();
                prompt = request.query.clone();
                Phase::NoCache
            }
        };
        debug!(request_id = %request.request_id, phase = ?phase, "Context prepared");

        // Load phases may still be cancelled; once evaluation starts,
        // cancellation only stops further token production.
        if self.cancel.load(Ordering::Relaxed) {
            let _ = tx
                .send(GenerationEvent::Cancelled {
                    completion_tokens: 0,
                })
                .await;
            return Phase::Cancelled;
        }

        // ── Generating ────────────────────────────────────────────────────
        debug!(request_id = %request.request_id, phase = ?Phase::Generating, "Evaluating prompt");

        let tokens = backend.tokenize(&prompt);
        if let Err(e) = backend.evaluate(&tokens).await {
            let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
            return Phase::Failed;
        }

        // A config file can set a nonsensical bound; never let it panic the
        // worker (f64::clamp panics when min > max).
        let temperature = request
            .temperature
            .clamp(0.0, self.config.max_temperature.max(0.0));

        // ── Streaming ─────────────────────────────────────────────────────
        let mut produced = 0;
        for _ in 0..request.max_tokens {
            if self.cancel.load(Ordering::Relaxed) {
                let _ = tx
                    .send(GenerationEvent::Cancelled {
                        completion_tokens: produced,
                    })
                    .await;
                return Phase::Cancelled;
            }

            match backend.next_token(temperature).await {
                Ok(Some((_token_id, text))) => {
                    let event = GenerationEvent::Token {
                        index: produced,
                        text,
                    };
                    produced += 1;
                    if let Err(SendError(_)) = tx.send(event).await {
                        // Receiver dropped; stop generating.
                        return Phase::Cancelled;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                    return Phase::Failed;
                }
            }
        }

        // ── Completed ─────────────────────────────────────────────────────
        if let Some(id) = &used_cache {
            self.record_usage(id).await;
        }

        let _ = tx
            .send(GenerationEvent::Done {
                completion_tokens: produced,
                used_cache,
                fallback,
            })
            .await;

        Phase::Completed
    }

    /// Build the fallback prompt: a bounded excerpt of the original document
    /// wrapped around the query. An unreadable document degrades further to
    /// the bare query; the warning event has already been emitted.
    async fn fallback_prompt(&self, entry: &CacheEntry, query: &str) -> String {
        match tokio::fs::read_to_string(&entry.document.path).await {
            Ok(content) => {
                let excerpt: String = content
                    .chars()
                    .take(self.config.fallback_excerpt_chars)
                    .collect();
                debug!(
                    id = %entry.id,
                    excerpt_chars = excerpt.len(),
                    "Prepared fallback excerpt"
                );
                format!(
                    "Use the following text to answer the user's question:\n\
                     --- TEXT START ---\n{excerpt}\n--- TEXT END ---\n\n\
                     Answer based only on the text provided above.\n\n\
                     Question: {query}\n\nAnswer: "
                )
            }
            Err(e) => {
                warn!(
                    id = %entry.id,
                    document = %entry.document.path.display(),
                    error = %e,
                    "Original document unreadable, proceeding with bare query"
                );
                query.to_string()
            }
        }
    }

    /// Usage logging is advisory: failures are logged, never surfaced.
    async fn record_usage(&self, id: &str) {
        let completed_at = unix_now();
        if let Err(e) = self.usage.write().await.record(id, completed_at).await {
            warn!(id, error = %e, "Failed to record cache usage");
        }
        if let Err(e) = self.registry.write().await.touch(id, completed_at).await {
            warn!(id, error = %e, "Failed to update registry usage fields");
        }
    }
}
