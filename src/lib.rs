//! cag-cache: persistent KV-state cache manager for LLM inference.
//!
//! Processes a document once, persists the model's internal state to disk,
//! and serves every later query by restoring that state instead of
//! re-evaluating the document. When a persisted state is missing, corrupt or
//! was built by a different model, generation degrades to injecting a
//! bounded excerpt of the original document, and the caller is always told.
//!
//! Exposes a small HTTP API for cache management and streamed generation.

pub mod cache;
pub mod config;
pub mod inference;
pub mod server;
