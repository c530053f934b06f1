pub mod config;
pub mod crypto;
pub mod otp;
pub mod store;
pub mod types;
pub mod validation;
