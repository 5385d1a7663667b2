//! Turnstile - per-client sliding-window rate limiting
//!
//! This crate implements request admission control for a single process.
//! Each caller identity gets its own log of recent request timestamps;
//! a request is admitted while fewer than `limit` of them fall inside the
//! trailing `window`. Idle callers are reclaimed by a background task owned
//! by the limiter, so memory stays bounded without a global lock on the
//! request path.

pub mod config;
pub mod error;
pub mod ratelimit;
