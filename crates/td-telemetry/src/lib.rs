//! Observability for tourdesk services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Request ids**: `X-Request-Id` propagation and one `http_request` span
//!   per request
//! - **Metrics**: in-process request counters and latency histogram, rendered
//!   in Prometheus text format

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
