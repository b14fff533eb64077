//! # cf-model
//!
//! Calibration data model for combfit.
//!
//! This crate owns the persisted shapes: bin boundaries and specifications,
//! per-bin measurements with named systematic errors, analyses (one
//! efficiency/scale-factor measurement each), cross-analysis statistical
//! correlation declarations, and the top-level [`CalibrationInfo`] container.
//!
//! It also owns the bin consistency checker: pure validation that bin edges
//! tile each axis, that analyses being combined carry mutually compatible
//! binnings, and that shared systematic names agree on their correlation
//! flag.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod analysis;
pub mod bins;
pub mod consistency;

pub use analysis::{
    Analysis, AnalysisCorrelation, AnalysisIdentity, BinCorrelation, CalibrationInfo,
};
pub use bins::{Bin, BinBoundary, BinSpec, MetaValue, SystematicError, EXTRAPOLATION_SYS};
