//! Bin boundaries, bin specifications, and per-bin measurements
//!
//! A [`BinSpec`] is the position of a bin in measurement phase space: one
//! `(variable, low, high)` boundary per independent axis, stored in canonical
//! order so that positional equality is plain `==`. Edge values are literal,
//! copied numbers from the calibration input, so equality on them is exact
//! floating-point equality.

use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Name of the synthetic systematic carried by extrapolated bins.
pub const EXTRAPOLATION_SYS: &str = "extrapolation";

/// One axis boundary of a bin: the interval `[low, high)` on `variable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinBoundary {
    /// Axis variable name (e.g. `"pt"`, `"eta"`)
    pub variable: String,
    /// Lower edge
    pub low: f64,
    /// Upper edge
    pub high: f64,
}

impl BinBoundary {
    /// Create a boundary.
    pub fn new(variable: impl Into<String>, low: f64, high: f64) -> Self {
        Self { variable: variable.into(), low, high }
    }

    /// Diagnostic name fragment: `"<low>-<variable>-<high>"`.
    fn name_fragment(&self) -> String {
        format!("{}-{}-{}", self.low, self.variable, self.high)
    }
}

impl PartialEq for BinBoundary {
    fn eq(&self, other: &Self) -> bool {
        self.variable == other.variable && self.low == other.low && self.high == other.high
    }
}

// Edges are literal input values; NaN edges are rejected when a Bin is
// validated, so exact f64 equality is a valid equivalence here.
impl Eq for BinBoundary {}

impl Ord for BinBoundary {
    fn cmp(&self, other: &Self) -> Ordering {
        self.variable
            .cmp(&other.variable)
            .then_with(|| self.low.total_cmp(&other.low))
            .then_with(|| self.high.total_cmp(&other.high))
    }
}

impl PartialOrd for BinBoundary {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name_fragment())
    }
}

/// The position of a bin: one boundary per independent axis.
///
/// Canonically sorted by (variable, low, high); no two boundaries may share
/// an axis variable. Positional equality between bins is `==` on this type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<BinBoundary>", into = "Vec<BinBoundary>")]
pub struct BinSpec {
    boundaries: Vec<BinBoundary>,
}

impl BinSpec {
    /// Build a spec from boundaries in any order.
    ///
    /// Sorts into canonical order and rejects duplicate axis variables.
    pub fn new(mut boundaries: Vec<BinBoundary>) -> Result<Self> {
        boundaries.sort();
        for pair in boundaries.windows(2) {
            if pair[0].variable == pair[1].variable {
                return Err(Error::DuplicateVariable { variable: pair[0].variable.clone() });
            }
        }
        Ok(Self { boundaries })
    }

    /// Boundaries in canonical order.
    pub fn boundaries(&self) -> &[BinBoundary] {
        &self.boundaries
    }

    /// Number of axes.
    pub fn dimension(&self) -> usize {
        self.boundaries.len()
    }

    /// The boundary for one axis variable, if present.
    pub fn boundary(&self, variable: &str) -> Option<&BinBoundary> {
        self.boundaries.iter().find(|b| b.variable == variable)
    }

    /// Axis variable names, in canonical order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.boundaries.iter().map(|b| b.variable.as_str())
    }

    /// Whether `self` and `other` span the same set of axis variables.
    pub fn same_axes(&self, other: &BinSpec) -> bool {
        self.boundaries.len() == other.boundaries.len()
            && self.variables().eq(other.variables())
    }

    /// Whether `other` lies fully inside `self` on every axis.
    ///
    /// Requires the same axis set; containment is inclusive on both edges.
    pub fn contains(&self, other: &BinSpec) -> bool {
        self.same_axes(other)
            && self
                .boundaries
                .iter()
                .zip(other.boundaries.iter())
                .all(|(outer, inner)| outer.low <= inner.low && inner.high <= outer.high)
    }

    /// Canonical bin name: `"<low>-<variable>-<high>[:<low>-<variable>-<high>...]"`.
    pub fn name(&self) -> String {
        let fragments: Vec<String> =
            self.boundaries.iter().map(BinBoundary::name_fragment).collect();
        fragments.join(":")
    }
}

impl TryFrom<Vec<BinBoundary>> for BinSpec {
    type Error = Error;

    fn try_from(boundaries: Vec<BinBoundary>) -> Result<Self> {
        BinSpec::new(boundaries)
    }
}

impl From<BinSpec> for Vec<BinBoundary> {
    fn from(spec: BinSpec) -> Self {
        spec.boundaries
    }
}

impl fmt::Display for BinSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One named systematic-error contribution, as an absolute value.
///
/// The sign is kept internally (it carries correlation information through
/// the combination); magnitudes are what enter quadrature sums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystematicError {
    /// Error source name. Same name across measurements means fully
    /// correlated, unless flagged `uncorrelated`.
    pub name: String,
    /// Absolute contribution (signed)
    pub value: f64,
    /// If set, this source is independent between measurements even when the
    /// name matches.
    #[serde(default)]
    pub uncorrelated: bool,
}

impl SystematicError {
    /// Create a correlated systematic error.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), value, uncorrelated: false }
    }

    /// Create an uncorrelated systematic error.
    pub fn uncorrelated(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), value, uncorrelated: true }
    }
}

/// A metadata entry: a value with its error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaValue {
    /// Stored value
    pub value: f64,
    /// Error on the value
    pub error: f64,
}

/// One bin of one analysis: a position, a central value, and its errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    /// Position in phase space
    pub spec: BinSpec,
    /// Measured central value
    pub central_value: f64,
    /// Statistical error
    pub stat_error: f64,
    /// Set for bins produced by extrapolation. Extended bins carry exactly
    /// one systematic ([`EXTRAPOLATION_SYS`]) and are left out of the primary
    /// grid when an analysis mixes binning types.
    #[serde(default)]
    pub extended: bool,
    /// Named systematic-error contributions; names unique within the bin
    #[serde(default)]
    pub systematics: Vec<SystematicError>,
    /// Auxiliary per-bin values carried through combination
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
}

impl Bin {
    /// Create a bin with no systematics.
    pub fn new(spec: BinSpec, central_value: f64, stat_error: f64) -> Self {
        Self {
            spec,
            central_value,
            stat_error,
            extended: false,
            systematics: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Canonical bin name (see [`BinSpec::name`]).
    pub fn name(&self) -> String {
        self.spec.name()
    }

    /// Look up a systematic by name.
    pub fn systematic(&self, name: &str) -> Option<&SystematicError> {
        self.systematics.iter().find(|s| s.name == name)
    }

    /// Insert a systematic, replacing any previous entry with the same name.
    pub fn set_systematic(&mut self, sys: SystematicError) {
        match self.systematics.iter_mut().find(|s| s.name == sys.name) {
            Some(existing) => *existing = sys,
            None => self.systematics.push(sys),
        }
    }

    /// Remove a systematic by name. Returns whether an entry was removed.
    pub fn remove_systematic(&mut self, name: &str) -> bool {
        let before = self.systematics.len();
        self.systematics.retain(|s| s.name != name);
        self.systematics.len() != before
    }

    /// Quadrature sum of all systematic contributions.
    pub fn total_systematic_error(&self) -> f64 {
        self.systematics.iter().map(|s| s.value * s.value).sum::<f64>().sqrt()
    }

    /// Total error: statistical and systematic in quadrature.
    pub fn total_error(&self) -> f64 {
        (self.stat_error * self.stat_error
            + self.systematics.iter().map(|s| s.value * s.value).sum::<f64>())
        .sqrt()
    }

    /// Verify that every serialized number is finite.
    ///
    /// Serialization must fail loudly rather than emit NaN into the output.
    pub fn validate_finite(&self) -> Result<()> {
        if !self.central_value.is_finite() {
            return Err(Error::NotFinite {
                context: format!("central value of bin `{}`", self.name()),
            });
        }
        if !self.stat_error.is_finite() {
            return Err(Error::NotFinite {
                context: format!("statistical error of bin `{}`", self.name()),
            });
        }
        for sys in &self.systematics {
            if !sys.value.is_finite() {
                return Err(Error::NotFinite {
                    context: format!("systematic `{}` of bin `{}`", sys.name, self.name()),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pairs: &[(&str, f64, f64)]) -> BinSpec {
        BinSpec::new(pairs.iter().map(|&(v, lo, hi)| BinBoundary::new(v, lo, hi)).collect())
            .unwrap()
    }

    #[test]
    fn boundary_equality_is_exact_on_all_fields() {
        let a = BinBoundary::new("pt", 20.0, 30.0);
        let b = BinBoundary::new("pt", 20.0, 30.0);
        let c = BinBoundary::new("pt", 20.0, 40.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, BinBoundary::new("eta", 20.0, 30.0));
        assert_ne!(a, BinBoundary::new("pt", 25.0, 30.0));
    }

    #[test]
    fn boundary_ordering() {
        let mut v = vec![
            BinBoundary::new("pt", 30.0, 60.0),
            BinBoundary::new("eta", 0.0, 2.5),
            BinBoundary::new("pt", 20.0, 30.0),
        ];
        v.sort();
        assert_eq!(v[0].variable, "eta");
        assert_eq!(v[1].low, 20.0);
        assert_eq!(v[2].low, 30.0);
    }

    #[test]
    fn spec_is_order_independent() {
        let a = spec(&[("pt", 20.0, 30.0), ("eta", 0.0, 2.5)]);
        let b = spec(&[("eta", 0.0, 2.5), ("pt", 20.0, 30.0)]);
        assert_eq!(a, b);
    }

    #[test]
    fn spec_rejects_duplicate_variable() {
        let err = BinSpec::new(vec![
            BinBoundary::new("pt", 20.0, 30.0),
            BinBoundary::new("pt", 30.0, 60.0),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateVariable { .. }));
    }

    #[test]
    fn spec_name_is_sorted() {
        let s = spec(&[("pt", 20.0, 30.0), ("eta", 0.0, 2.5)]);
        assert_eq!(s.name(), "0-eta-2.5:20-pt-30");
    }

    #[test]
    fn containment() {
        let outer = spec(&[("pt", 20.0, 60.0)]);
        let inner = spec(&[("pt", 30.0, 40.0)]);
        let other_axis = spec(&[("eta", 30.0, 40.0)]);
        assert!(outer.contains(&inner));
        assert!(outer.contains(&outer));
        assert!(!inner.contains(&outer));
        assert!(!outer.contains(&other_axis));
    }

    #[test]
    fn systematic_replacement() {
        let mut bin = Bin::new(spec(&[("eta", 0.0, 2.5)]), 1.0, 0.1);
        bin.set_systematic(SystematicError::new("jes", 0.02));
        bin.set_systematic(SystematicError::new("jes", 0.03));
        assert_eq!(bin.systematics.len(), 1);
        assert_eq!(bin.systematic("jes").unwrap().value, 0.03);
        assert!(bin.remove_systematic("jes"));
        assert!(!bin.remove_systematic("jes"));
    }

    #[test]
    fn nan_is_rejected_at_validation() {
        let mut bin = Bin::new(spec(&[("eta", 0.0, 2.5)]), 1.0, 0.1);
        assert!(bin.validate_finite().is_ok());
        bin.set_systematic(SystematicError::new("jes", f64::NAN));
        assert!(matches!(bin.validate_finite(), Err(Error::NotFinite { .. })));
        bin.remove_systematic("jes");
        bin.central_value = f64::NAN;
        assert!(bin.validate_finite().is_err());
    }

    #[test]
    fn total_error_quadrature() {
        let mut bin = Bin::new(spec(&[("eta", 0.0, 2.5)]), 1.0, 3.0);
        bin.set_systematic(SystematicError::new("a", 4.0));
        assert!((bin.total_error() - 5.0).abs() < 1e-12);
        assert!((bin.total_systematic_error() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn spec_json_round_trip() {
        let s = spec(&[("pt", 20.0, 30.0), ("eta", 0.0, 2.5)]);
        let text = serde_json::to_string(&s).unwrap();
        let back: BinSpec = serde_json::from_str(&text).unwrap();
        assert_eq!(s, back);
    }
}
