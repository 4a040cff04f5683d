//! Throttlegate - Per-Caller Request Rate Limiting
//!
//! This crate decides, for every incoming request, whether it may proceed
//! based on how many requests the same caller made within a rolling
//! activity window. Callers are identified by API key or client address,
//! and counters live in a shared key/value store with per-key expiry.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
