//! Spire common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Spire components.

pub mod config;
pub mod error;

pub use config::WalConfig;
pub use error::{Result, SpireError};
