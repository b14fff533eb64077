//! # cf-core
//!
//! Shared error taxonomy and result types for combfit.
//!
//! Everything downstream (`cf-model`, `cf-combine`, `cf-cli`) speaks in terms
//! of the [`Error`] enum and the [`CombinedValue`] result shape defined here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{CombinedValue, ErrorDisplay, FitQuality};
