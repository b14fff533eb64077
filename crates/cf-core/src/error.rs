//! Error types for combfit
//!
//! Structural input errors carry enough context (axis, offending edge values,
//! bin names) to produce an actionable diagnostic at the command level.
//! Degenerate-fit conditions are deliberately *not* represented here: those
//! are handled inside the combination engine by excluding measurements, never
//! by aborting.

use thiserror::Error;

/// combfit error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Two adjacent bins on one axis do not touch.
    #[error("bin boundary gap on axis `{variable}`: bin ending at {high} is followed by bin starting at {low}")]
    BoundaryGap {
        /// Axis variable name
        variable: String,
        /// Upper edge of the earlier bin
        high: f64,
        /// Lower edge of the later bin
        low: f64,
    },

    /// Two bins on one axis overlap.
    #[error("bin boundary overlap on axis `{variable}`: bin ending at {high} overlaps bin starting at {low}")]
    BoundaryOverlap {
        /// Axis variable name
        variable: String,
        /// Upper edge of the earlier bin
        high: f64,
        /// Lower edge of the later bin
        low: f64,
    },

    /// A bin edge of one analysis falls strictly inside a bin of another.
    #[error("incompatible binning on axis `{variable}`: edge {edge} straddles bin [{low}, {high}]")]
    BoundaryStraddle {
        /// Axis variable name
        variable: String,
        /// The offending edge value
        edge: f64,
        /// Lower edge of the straddled bin
        low: f64,
        /// Upper edge of the straddled bin
        high: f64,
    },

    /// A bin declares two boundaries for the same axis variable.
    #[error("duplicate axis variable `{variable}` in bin specification")]
    DuplicateVariable {
        /// Axis variable name
        variable: String,
    },

    /// Two bins of one analysis occupy the same position.
    #[error("duplicate bin `{bin}` in analysis `{analysis}`")]
    DuplicateBin {
        /// Bin name (canonical form)
        bin: String,
        /// Full analysis name
        analysis: String,
    },

    /// A systematic error is flagged correlated in one analysis and
    /// uncorrelated in another.
    #[error("systematic `{systematic}` is marked uncorrelated={first_flag} in `{first}` but uncorrelated={second_flag} in `{second}`")]
    FlagMismatch {
        /// Systematic error name
        systematic: String,
        /// First analysis (full name)
        first: String,
        /// Flag carried by the first analysis
        first_flag: bool,
        /// Second analysis (full name)
        second: String,
        /// Flag carried by the second analysis
        second_flag: bool,
    },

    /// Bins handed to a single combination do not share a position.
    #[error("bin specification mismatch: expected `{expected}`, found `{found}`")]
    BinSpecMismatch {
        /// Canonical name of the expected position
        expected: String,
        /// Canonical name of the offending position
        found: String,
    },

    /// A combination was requested with nothing to combine.
    #[error("empty combination: {0}")]
    EmptyCombination(String),

    /// A value that must be serialized is NaN or infinite.
    #[error("non-finite value in {context}")]
    NotFinite {
        /// Where the non-finite value was found
        context: String,
    },

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
