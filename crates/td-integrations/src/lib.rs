//! Outbound integrations: SMS delivery and object storage for uploads.
//!
//! Each integration is an async trait with an HTTP client and an in-memory
//! mock. Clients are only built when their credential env var is set.

pub mod sms;
pub mod storage;
