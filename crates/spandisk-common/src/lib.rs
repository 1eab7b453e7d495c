//! Spandisk Common - Shared types and utilities
//!
//! This crate provides the common types, error definitions, and
//! configuration structures used across all spandisk components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CtlConfig, DeviceSpec};
pub use error::{Error, Result};
pub use types::*;
