//! High-level locks built on the raw primitives.
pub mod lock;
