//! Harness: the request-guarding and lifecycle primitives shared by the HTTP
//! layer and the daemon.
//!
//! - `rate_limiter`: in-memory sliding-window limits per namespace and key
//! - `security`: free-text sanitisation for user-submitted content
//! - `shutdown`: cooperative shutdown across the server and background jobs

pub mod rate_limiter;
pub mod security;
pub mod shutdown;
