//! Core types shared across the sealink workspace.
//!
//! This crate holds the configuration model, connection identifiers and the
//! security mode switch. It contains no networking or cryptography.

pub mod config;
pub mod error;
pub mod id;

pub use config::{SecurityMode, WireConfig};
pub use error::ConfigError;
pub use id::ConnectionId;
