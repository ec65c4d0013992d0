//! HTTP caller surface.
//!
//! - [`api`]: axum router, request/response types, handlers
//! - [`streaming`]: generation event channel → SSE stream adapter

pub mod api;
pub mod streaming;
