//! # cf-combine
//!
//! The combination engine: takes independent measurements of the same
//! quantities, with named systematic-error contributions, and produces a
//! single best estimate per quantity by a constrained chi-square fit.
//!
//! Correlation between measurements is expressed through one mechanism only:
//! systematic errors with the same name share a single free nuisance
//! parameter. A measurement that does not declare a name has zero
//! sensitivity to that nuisance. Statistical correlations are reduced to the
//! same mechanism by splitting the statistical errors into an uncorrelated
//! remainder plus a synthetic shared systematic.
//!
//! Ill-posed correlation configurations (combination weights outside [0, 1])
//! never abort a fit: the weaker measurement is excluded with a warning and
//! the combination proceeds with the rest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod combiner;
pub mod context;
pub mod measurement;
pub mod optimizer;
pub mod rebin;

pub use combiner::{combine_analyses, combine_bin, CombinationMode, CombinedAnalyses};
pub use context::{CombinationContext, ContextFit, MeasurementId, STATISTICAL, STAT_FLOOR_FRACTION};
pub use measurement::{ssqrt, Measurement};
pub use optimizer::{BoundedMinimizer, Minimum, MinimizerConfig, Objective};
pub use rebin::rebin_analysis;
