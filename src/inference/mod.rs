//! Inference-side components.
//!
//! - [`model`]: model references and fingerprinting
//! - [`backend`]: the seam to the external inference engine
//! - [`engine`]: the generation state machine and streaming orchestration

pub mod backend;
pub mod engine;
pub mod model;
