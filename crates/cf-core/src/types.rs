//! Common result types for combfit

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Combined best estimate for one quantity.
///
/// Produced by a combination fit: the central value, the closed-form
/// statistical error, the total fit error, and the per-systematic breakdown
/// recovered from frozen-nuisance refits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedValue {
    /// Best-fit central value
    pub central_value: f64,

    /// Statistical-only error (inverse-variance closed form)
    pub stat_error: f64,

    /// Total fit error (sqrt of the covariance diagonal)
    pub total_error: f64,

    /// Signed per-systematic contributions, keyed by error name
    pub systematics: BTreeMap<String, f64>,

    /// Whether the joint minimization converged
    pub converged: bool,
}

impl CombinedValue {
    /// Quadrature sum of all systematic contributions.
    pub fn total_systematic_error(&self) -> f64 {
        self.systematics.values().map(|v| v * v).sum::<f64>().sqrt()
    }
}

/// Goodness-of-fit summary for one combination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitQuality {
    /// Global chi-square of the combination (BLUE closed form)
    pub chi2: f64,
    /// Degrees of freedom: measurements minus estimated quantities
    pub ndof: usize,
    /// Chi-square tail probability. NaN if `ndof == 0` or chi2 is NaN.
    pub p_value: f64,
}

/// How an error is rendered for display.
///
/// Fit arithmetic is always absolute; percent is a display-only transform.
/// Passed explicitly at the call site, never held in process-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDisplay {
    /// Render the error as stored.
    Absolute,
    /// Render the error as a percentage of the central value.
    Percent,
}

impl ErrorDisplay {
    /// Apply the display transform to an absolute error.
    pub fn render(&self, error: f64, central_value: f64) -> f64 {
        match self {
            ErrorDisplay::Absolute => error,
            ErrorDisplay::Percent => error / central_value * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_systematic_quadrature() {
        let mut systematics = BTreeMap::new();
        systematics.insert("a".to_string(), 3.0);
        systematics.insert("b".to_string(), -4.0);
        let v = CombinedValue {
            central_value: 1.0,
            stat_error: 0.1,
            total_error: 5.0,
            systematics,
            converged: true,
        };
        assert!((v.total_systematic_error() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn percent_display() {
        assert_eq!(ErrorDisplay::Percent.render(0.05, 0.5), 10.0);
        assert_eq!(ErrorDisplay::Absolute.render(0.05, 0.5), 0.05);
    }
}
