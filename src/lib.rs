//! Turnstile - rule-based request rate limiting
//!
//! This crate implements the admission gate an HTTP API proxy consults before
//! forwarding each request. Rules match on client address and request path,
//! count hits in fixed windows held in a shared store (Redis in production),
//! and can be edited on disk while the service runs.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod reload;
pub mod store;
