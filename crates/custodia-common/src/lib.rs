//! Custodia Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, conversions and error handling for the custodia workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CustodiaError`] and the crate [`Result`] alias
//! - **Conversions**: Brazilian-locale dates and numbers, null detection
//! - **Checksums**: SHA-256 helpers used for header fingerprints
//! - **Names**: the `<type>-<date>` file name grammar of custody extracts
//! - **Types**: the [`Value`] cell and the [`Dataset`] table
//! - **Logging**: `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use custodia_common::convert::to_number;
//! use custodia_common::Result;
//!
//! fn total(cells: &[&str]) -> Result<f64> {
//!     let mut sum = 0.0;
//!     for cell in cells {
//!         sum += to_number(Some(cell))?.unwrap_or_default();
//!     }
//!     Ok(sum)
//! }
//! ```

pub mod checksum;
pub mod convert;
pub mod error;
pub mod logging;
pub mod names;
pub mod types;

// Re-export commonly used types
pub use error::{CustodiaError, Result};
pub use types::{ColumnType, Dataset, Value};
