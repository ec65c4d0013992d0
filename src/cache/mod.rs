//! Cache lifecycle management.
//!
//! This module contains the durable cache state and its operations:
//! - [`store`]: on-disk blob envelope + metadata sidecar, atomic writes
//! - [`registry`]: durable index of cache entries, master flag, recovery
//! - [`usage`]: secondary durable index of per-entry usage statistics
//! - [`selector`]: active-entry resolution and model-compatibility check
//! - [`purge`]: single and bulk deletion keeping all three stores consistent

pub mod purge;
pub mod registry;
pub mod selector;
pub mod store;
pub mod usage;

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
