//! SQL Relay Common Library
//!
//! Shared types and utilities for all SQL Relay services: the error type,
//! instance configuration, filesystem layout, client-visible error codes,
//! authentication, and telemetry setup.

pub mod auth;
pub mod client_errors;
pub mod config;
pub mod error;
pub mod paths;
pub mod telemetry;

// Re-export commonly used types
pub use auth::{Authenticator, StaticUserList};
pub use client_errors::ClientLimitError;
pub use config::InstanceConfig;
pub use error::{RelayError, Result};
pub use paths::InstanceDirs;
