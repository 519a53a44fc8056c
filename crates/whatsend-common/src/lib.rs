//! Whatsend Common - Shared types and utilities
//!
//! This crate provides configuration, the shared error type, and the
//! template/variable-mapping types used by every Whatsend component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
