//! SIMS Core
//!
//! Core types and error handling shared across the SIMS crates.
//!
//! This crate provides:
//! - The workspace error type and result alias
//! - Train/validation/test split tags used to prefix logged metrics
//! - Device selection for the Candle backend

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{DeviceSpec, Tag};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::{DeviceSpec, Tag};
}
