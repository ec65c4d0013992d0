//! Seam to the external inference engine.
//!
//! The engine that actually owns the model weights and the restored KV state
//! sits behind [`InferenceBackend`]. The core never assumes anything about
//! the state payload beyond what the envelope records.
//!
//! [`LocalBackend`] is a deterministic stand-in used by the binary and the
//! tests. A real llama.cpp-backed implementation would replace it behind the
//! same trait.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::inference::model::{ModelFingerprint, ModelRef};

/// Token identifier in the backend's vocabulary.
pub type TokenId = i32;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("state restore failed: {0}")]
    StateRestore(String),

    #[error("evaluation failed: {0}")]
    Eval(String),
}

/// The shared, stateful inference resource.
///
/// Implementations are single-writer by contract: the generation engine
/// guarantees at most one request holds a backend at a time.
#[async_trait]
pub trait InferenceBackend: Send {
    /// Fingerprint of the loaded model.
    fn fingerprint(&self) -> &ModelFingerprint;

    /// Context window in tokens.
    fn context_size(&self) -> usize;

    /// Replace the internal state with a previously persisted snapshot.
    async fn restore_state(&mut self, blob: &[u8]) -> Result<(), BackendError>;

    /// Drop any restored or accumulated state.
    fn reset(&mut self);

    /// Convert text to token ids.
    fn tokenize(&self, text: &str) -> Vec<TokenId>;

    /// Feed tokens through the model, extending the internal state.
    async fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), BackendError>;

    /// Sample the next output token, or `None` at end of output.
    async fn next_token(
        &mut self,
        temperature: f64,
    ) -> Result<Option<(TokenId, String)>, BackendError>;
}

/// Deterministic in-process backend.
///
/// Tokenizes by whitespace, tracks an evaluated-token count against the
/// context window, and emits a fixed-length synthetic answer. Restoring a
/// state simply credits the snapshot's token count toward the context.
pub struct LocalBackend {
    fingerprint: ModelFingerprint,
    context_size: usize,
    restored_tokens: usize,
    evaluated_tokens: usize,
    emitted: usize,
    answer_tokens: usize,
}

impl LocalBackend {
    /// Default length of the synthetic answer.
    pub const DEFAULT_ANSWER_TOKENS: usize = 32;

    /// Load the backend for a model on disk.
    pub fn load(model: &ModelRef) -> Result<Self, BackendError> {
        let fingerprint = model
            .fingerprint()
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?;

        debug!(fingerprint = %fingerprint, context_size = model.context_size, "Backend loaded");

        Ok(Self {
            fingerprint,
            context_size: model.context_size,
            restored_tokens: 0,
            evaluated_tokens: 0,
            emitted: 0,
            answer_tokens: Self::DEFAULT_ANSWER_TOKENS,
        })
    }

    /// Override the synthetic answer length (tests).
    pub fn with_answer_tokens(mut self, n: usize) -> Self {
        self.answer_tokens = n;
        self
    }

    fn tokens_in_context(&self) -> usize {
        self.restored_tokens + self.evaluated_tokens + self.emitted
    }
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn fingerprint(&self) -> &ModelFingerprint {
        &self.fingerprint
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    async fn restore_state(&mut self, blob: &[u8]) -> Result<(), BackendError> {
        if blob.is_empty() {
            return Err(BackendError::StateRestore("empty state payload".into()));
        }
        self.reset();
        // Roughly four bytes of state per context token.
        self.restored_tokens = (blob.len() / 4).max(1);
        debug!(restored_tokens = self.restored_tokens, "State restored");
        Ok(())
    }

    fn reset(&mut self) {
        self.restored_tokens = 0;
        self.evaluated_tokens = 0;
        self.emitted = 0;
    }

    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.split_whitespace()
            .map(|w| (crate::inference::model::content_hash(w.as_bytes()) % 50_000) as TokenId)
            .collect()
    }

    async fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        if self.tokens_in_context() + tokens.len() > self.context_size {
            return Err(BackendError::Eval(format!(
                "context overflow: {} + {} tokens exceeds window of {}",
                self.tokens_in_context(),
                tokens.len(),
                self.context_size
            )));
        }
        self.evaluated_tokens += tokens.len();
        Ok(())
    }

    async fn next_token(
        &mut self,
        _temperature: f64,
    ) -> Result<Option<(TokenId, String)>, BackendError> {
        if self.emitted >= self.answer_tokens || self.tokens_in_context() >= self.context_size {
            return Ok(None);
        }
        let index = self.emitted;
        self.emitted += 1;
        Ok(Some(((index % 100) as TokenId, format!("token_{index} "))))
    }
}
