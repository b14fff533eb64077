//! The engine-internal measurement model
//!
//! A [`Measurement`] is one scalar estimate of one quantity (`what`): a
//! central value, a statistical error, and a list of named systematic-error
//! contributions. Measurements are owned by the [`crate::CombinationContext`]
//! that created them and are never persisted.

/// Signed square root: `sign(v) * sqrt(|v|)`.
///
/// Keeps sign information alive through quadrature arithmetic that can go
/// negative in degenerate correlation configurations.
pub fn ssqrt(v: f64) -> f64 {
    if v < 0.0 { -(-v).sqrt() } else { v.sqrt() }
}

/// One scalar measurement of one quantity.
#[derive(Debug, Clone)]
pub struct Measurement {
    name: String,
    what: String,
    value: f64,
    stat_error: f64,
    systematics: Vec<(String, f64)>,
    do_not_use: bool,
}

impl Measurement {
    /// Create a measurement with no systematics.
    pub fn new(
        name: impl Into<String>,
        what: impl Into<String>,
        value: f64,
        stat_error: f64,
    ) -> Self {
        Self {
            name: name.into(),
            what: what.into(),
            value,
            stat_error: stat_error.abs(),
            systematics: Vec::new(),
            do_not_use: false,
        }
    }

    /// Measurement name (unique within a context).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The quantity this measurement estimates.
    pub fn what(&self) -> &str {
        &self.what
    }

    /// Central value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Statistical error.
    pub fn stat_error(&self) -> f64 {
        self.stat_error
    }

    /// Replace the statistical error (used by the correlation resolver).
    pub fn set_stat_error(&mut self, stat_error: f64) {
        self.stat_error = stat_error.abs();
    }

    /// Whether this measurement has been excluded from its group.
    pub fn excluded(&self) -> bool {
        self.do_not_use
    }

    /// Exclude or re-include this measurement.
    pub fn set_excluded(&mut self, excluded: bool) {
        self.do_not_use = excluded;
    }

    /// Register a named systematic as an absolute (signed) value.
    ///
    /// Re-registering a name replaces the previous value.
    pub fn add_systematic(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.systematics.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.systematics.push((name, value)),
        }
    }

    /// Register a systematic given as a fraction of the central value.
    ///
    /// Converted to absolute against the central value now, not re-derived
    /// later.
    pub fn add_systematic_rel(&mut self, name: impl Into<String>, rel: f64) {
        let abs = rel * self.value;
        self.add_systematic(name, abs);
    }

    /// Register a systematic given as a percentage of the central value.
    pub fn add_systematic_percent(&mut self, name: impl Into<String>, percent: f64) {
        let abs = percent / 100.0 * self.value;
        self.add_systematic(name, abs);
    }

    /// The registered systematics, in registration order.
    pub fn systematics(&self) -> &[(String, f64)] {
        &self.systematics
    }

    /// The signed value of one systematic, if registered.
    pub fn systematic(&self, name: &str) -> Option<f64> {
        self.systematics.iter().find(|(n, _)| n == name).map(|&(_, v)| v)
    }

    /// Whether a systematic with this name is registered.
    pub fn has_systematic(&self, name: &str) -> bool {
        self.systematics.iter().any(|(n, _)| n == name)
    }

    /// Remove a systematic. Returns its value if it was present.
    pub fn remove_systematic(&mut self, name: &str) -> Option<f64> {
        let idx = self.systematics.iter().position(|(n, _)| n == name)?;
        Some(self.systematics.remove(idx).1)
    }

    /// Quadrature sum of all systematic values.
    pub fn total_systematic_error(&self) -> f64 {
        self.systematics.iter().map(|(_, v)| v * v).sum::<f64>().sqrt()
    }

    /// Total error: statistical plus systematics in quadrature.
    pub fn total_error(&self) -> f64 {
        (self.stat_error * self.stat_error
            + self.systematics.iter().map(|(_, v)| v * v).sum::<f64>())
        .sqrt()
    }

    /// Partition this measurement's total error against `other` into
    /// `(uncorrelated, correlated)` parts, both as signed square roots.
    ///
    /// The statistical error counts as wholly uncorrelated; a systematic is
    /// correlated iff `other` also carries its name. Passing the same
    /// measurement on both sides therefore reports every systematic as
    /// shared and the uncorrelated part is exactly the statistical error.
    pub fn shared_error(&self, other: &Measurement) -> (f64, f64) {
        let mut uncorrelated = self.stat_error * self.stat_error;
        let mut correlated = 0.0;
        for (name, value) in &self.systematics {
            if other.has_systematic(name) {
                correlated += value * value;
            } else {
                uncorrelated += value * value;
            }
        }
        (ssqrt(uncorrelated), ssqrt(correlated))
    }

    /// Correlation coefficient with `other`, without range clamping.
    ///
    /// Sum over shared systematic names of the signed product of values,
    /// normalized by both total errors. Statistical errors contribute
    /// nothing unless a synthetic shared systematic was injected by the
    /// correlation resolver.
    pub fn rho_unbounded(&self, other: &Measurement) -> f64 {
        let denom = self.total_error() * other.total_error();
        if denom == 0.0 {
            return 0.0;
        }
        let shared: f64 = self
            .systematics
            .iter()
            .filter_map(|(name, v)| other.systematic(name).map(|w| v * w))
            .sum();
        shared / denom
    }

    /// Correlation coefficient with `other`, clamped to [-1, 1].
    ///
    /// An unbounded value outside that range indicates an inconsistent
    /// error decomposition in the inputs; it is logged and clamped.
    pub fn rho(&self, other: &Measurement) -> f64 {
        let rho = self.rho_unbounded(other);
        if !(-1.0..=1.0).contains(&rho) {
            log::warn!(
                "correlation between `{}` and `{}` is {:.4}, outside [-1, 1]; clamping",
                self.name,
                other.name,
                rho
            );
            return rho.clamp(-1.0, 1.0);
        }
        rho
    }

    /// Covariance with `other`: `rho * totalError(self) * totalError(other)`.
    ///
    /// The same object on both sides short-circuits to `totalError^2`; the
    /// rho path is not trustworthy for identical operands.
    pub fn covar(&self, other: &Measurement) -> f64 {
        if std::ptr::eq(self, other) {
            let t = self.total_error();
            return t * t;
        }
        self.rho(other) * self.total_error() * other.total_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ssqrt_preserves_sign() {
        assert_eq!(ssqrt(4.0), 2.0);
        assert_eq!(ssqrt(-4.0), -2.0);
        assert_eq!(ssqrt(0.0), 0.0);
    }

    #[test]
    fn relative_and_percent_registration_use_current_central_value() {
        let mut m = Measurement::new("m", "sf", 2.0, 0.1);
        m.add_systematic_rel("a", 0.05);
        m.add_systematic_percent("b", 5.0);
        assert_relative_eq!(m.systematic("a").unwrap(), 0.1);
        assert_relative_eq!(m.systematic("b").unwrap(), 0.1);
    }

    #[test]
    fn re_registration_replaces() {
        let mut m = Measurement::new("m", "sf", 1.0, 0.1);
        m.add_systematic("a", 0.2);
        m.add_systematic("a", 0.3);
        assert_eq!(m.systematics().len(), 1);
        assert_eq!(m.systematic("a").unwrap(), 0.3);
    }

    #[test]
    fn total_error_quadrature() {
        let mut m = Measurement::new("m", "sf", 1.0, 3.0);
        m.add_systematic("a", 4.0);
        assert_relative_eq!(m.total_error(), 5.0);
    }

    #[test]
    fn shared_error_splits_by_name() {
        let mut m1 = Measurement::new("m1", "sf", 1.0, 0.3);
        m1.add_systematic("shared", 0.4);
        m1.add_systematic("own", 0.5);
        let mut m2 = Measurement::new("m2", "sf", 1.1, 0.2);
        m2.add_systematic("shared", 0.1);

        let (unc, cor) = m1.shared_error(&m2);
        assert_relative_eq!(unc, (0.3f64 * 0.3 + 0.5 * 0.5).sqrt());
        assert_relative_eq!(cor, 0.4);
    }

    #[test]
    fn self_shared_error_reports_systematics_as_shared() {
        let mut m = Measurement::new("m", "sf", 1.0, 0.25);
        m.add_systematic("s", 0.6);
        let (unc, cor) = m.shared_error(&m);
        assert_relative_eq!(unc, 0.25);
        assert_relative_eq!(cor, 0.6);
    }

    #[test]
    fn rho_of_independent_measurements_is_zero() {
        let m1 = Measurement::new("m1", "sf", 1.0, 0.1);
        let m2 = Measurement::new("m2", "sf", 1.1, 0.2);
        assert_eq!(m1.rho(&m2), 0.0);
    }

    #[test]
    fn rho_signed_product() {
        let mut m1 = Measurement::new("m1", "sf", 1.0, 0.0);
        m1.add_systematic("s", 0.1);
        let mut m2 = Measurement::new("m2", "sf", 1.1, 0.0);
        m2.add_systematic("s", -0.2);
        // Fully (anti-)correlated: rho = -1.
        assert_relative_eq!(m1.rho(&m2), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn self_covariance_is_total_error_squared() {
        let mut m = Measurement::new("m", "sf", 1.0, 0.3);
        m.add_systematic("s", 0.4);
        assert_relative_eq!(m.covar(&m), 0.25);
    }

    #[test]
    fn covariance_of_distinct_measurements() {
        let mut m1 = Measurement::new("m1", "sf", 1.0, 0.3);
        m1.add_systematic("s", 0.4);
        let mut m2 = Measurement::new("m2", "sf", 1.1, 0.0);
        m2.add_systematic("s", 0.2);
        // rho = 0.4*0.2 / (0.5*0.2) = 0.8; covar = 0.8 * 0.5 * 0.2 = 0.08
        assert_relative_eq!(m1.covar(&m2), 0.08, epsilon = 1e-12);
    }
}
