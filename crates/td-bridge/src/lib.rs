//! HTTP surface of tourdesk: the axum router, session and cron
//! authentication, rate limiting and the scheduled jobs shared with the
//! daemon.

pub mod api_error;
pub mod auth;
pub mod cron;
pub mod http_api;
pub mod rate_limit_middleware;
pub mod side_effects;
