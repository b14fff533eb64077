//! The combination context: measurement registry and constrained fit
//!
//! A [`CombinationContext`] owns a set of [`Measurement`]s grouped by the
//! quantity they estimate. [`CombinationContext::fit`] builds one free
//! parameter per quantity plus one shared nuisance parameter per distinct
//! systematic-error name, minimizes the joint chi-square with unit Gaussian
//! pull terms on every nuisance, and recovers a per-systematic error
//! breakdown by refitting with each nuisance frozen at zero.

use crate::measurement::Measurement;
use crate::optimizer::{BoundedMinimizer, MinimizerConfig, Objective};
use cf_core::{CombinedValue, Error, FitQuality, Result};
use nalgebra::DMatrix;
use statrs::function::gamma::gamma_lr;
use std::collections::{BTreeMap, BTreeSet};

/// The only error name [`CombinationContext::add_correlation`] accepts.
pub const STATISTICAL: &str = "statistical";

/// Statistical errors below this fraction of the central value are raised to
/// it before fitting; far smaller errors leave the minimizer ill-conditioned.
pub const STAT_FLOOR_FRACTION: f64 = 0.01;

/// Absolute tolerance on the error-decomposition closure check,
/// in units of error squared.
const CLOSURE_TOLERANCE: f64 = 0.01;

/// Prefix of synthetic systematics injected by the correlation resolver.
/// The underscore keeps them outside any user systematic namespace.
const SYNTHETIC_PREFIX: &str = "_statcorr";

/// Handle to a measurement registered in a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementId(usize);

/// Result of one [`CombinationContext::fit`] call.
#[derive(Debug, Clone)]
pub struct ContextFit {
    /// Per-quantity combined values, keyed by `what`
    pub results: BTreeMap<String, CombinedValue>,
    /// Global goodness of fit
    pub quality: FitQuality,
    /// Whether the joint minimization converged
    pub converged: bool,
}

/// Owns measurements and runs the combination fit.
#[derive(Debug, Default)]
pub struct CombinationContext {
    measurements: Vec<Measurement>,
    synthetic: BTreeSet<String>,
    next_synthetic: usize,
    config: MinimizerConfig,
}

impl CombinationContext {
    /// Create an empty context with default minimizer settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with explicit minimizer settings.
    pub fn with_config(config: MinimizerConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Register a measurement of `what`. Names must be unique per context.
    pub fn add_measurement(
        &mut self,
        name: impl Into<String>,
        what: impl Into<String>,
        value: f64,
        stat_error: f64,
    ) -> MeasurementId {
        self.measurements.push(Measurement::new(name, what, value, stat_error));
        MeasurementId(self.measurements.len() - 1)
    }

    /// Access a registered measurement.
    pub fn measurement(&self, id: MeasurementId) -> &Measurement {
        &self.measurements[id.0]
    }

    /// Mutable access to a registered measurement (to wire systematics).
    pub fn measurement_mut(&mut self, id: MeasurementId) -> &mut Measurement {
        &mut self.measurements[id.0]
    }

    /// Number of registered measurements (including excluded ones).
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Whether no measurements are registered.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Declare a statistical correlation `rho` between two measurements of
    /// the same quantity.
    ///
    /// The statistical errors of both are re-split into independent parts
    /// plus a synthetic shared systematic sized to reproduce `rho`; the
    /// bookkeeping is undone in the fit results, so the synthetic name never
    /// becomes user-visible. A correlation that would force a combination
    /// weight outside [0, 1] excludes the measurement with the larger total
    /// error instead of failing.
    pub fn add_correlation(
        &mut self,
        error_name: &str,
        m1: MeasurementId,
        m2: MeasurementId,
        rho: f64,
    ) -> Result<()> {
        if error_name != STATISTICAL {
            return Err(Error::Validation(format!(
                "only `{STATISTICAL}` correlations are supported, got `{error_name}`"
            )));
        }
        if m1 == m2 {
            return Err(Error::Validation(
                "cannot declare a correlation between a measurement and itself".into(),
            ));
        }
        if !(-1.0..=1.0).contains(&rho) {
            return Err(Error::Validation(format!(
                "statistical correlation {rho} outside [-1, 1]"
            )));
        }
        if self.measurements[m1.0].what() != self.measurements[m2.0].what() {
            return Err(Error::Validation(format!(
                "measurements `{}` and `{}` estimate different quantities",
                self.measurements[m1.0].name(),
                self.measurements[m2.0].name()
            )));
        }
        if rho == 0.0 {
            return Ok(());
        }
        // Exact unit correlation makes the constraint singular.
        let rho = if rho == 1.0 {
            log::warn!(
                "statistical correlation between `{}` and `{}` is exactly 1; using 0.99",
                self.measurements[m1.0].name(),
                self.measurements[m2.0].name()
            );
            0.99
        } else {
            rho
        };

        let s1 = self.measurements[m1.0].stat_error();
        let s2 = self.measurements[m2.0].stat_error();

        // A correlation this strong would give one measurement a negative
        // weight in the naive two-point combination; drop the weaker one
        // rather than poison the whole group.
        let denom = s1 * s1 + s2 * s2 - 2.0 * rho * s1 * s2;
        let weight = (s2 * s2 - rho * s1 * s2) / denom;
        if !(0.0..=1.0).contains(&weight) {
            let victim = self.weaker_of(m1, m2);
            log::warn!(
                "statistical correlation {} between `{}` and `{}` implies weight {:.3}; excluding `{}`",
                rho,
                self.measurements[m1.0].name(),
                self.measurements[m2.0].name(),
                weight,
                self.measurements[victim.0].name()
            );
            self.measurements[victim.0].set_excluded(true);
            return Ok(());
        }

        // Split both statistical errors into an independent remainder plus a
        // shared synthetic systematic reproducing rho. The non-negative root
        // of  s2c^4 + (s1^2 - s2^2) s2c^2 - (rho s1 s2)^2 = 0  fixes the
        // shared component on the second measurement; both keep an
        // equal-sized independent remainder to stay well-posed.
        let d = s1 * s1 - s2 * s2;
        let k = rho * s1 * s2;
        let s2c2 = (0.5 * (-d + (d * d + 4.0 * k * k).sqrt())).max(0.0);
        let s2c = s2c2.sqrt();
        let s1c = if s2c == 0.0 { 0.0 } else { k / s2c };
        let s2u = (s2 * s2 - s2c2).max(0.0).sqrt();
        let s1u = s2u;

        let name = format!("{}{}", SYNTHETIC_PREFIX, self.next_synthetic);
        self.next_synthetic += 1;
        self.synthetic.insert(name.clone());

        let first = &mut self.measurements[m1.0];
        first.set_stat_error(s1u);
        first.add_systematic(name.clone(), s1c);
        let second = &mut self.measurements[m2.0];
        second.set_stat_error(s2u);
        second.add_systematic(name, s2c);
        Ok(())
    }

    fn weaker_of(&self, m1: MeasurementId, m2: MeasurementId) -> MeasurementId {
        if self.measurements[m1.0].total_error() >= self.measurements[m2.0].total_error() {
            m1
        } else {
            m2
        }
    }

    /// Exclude measurements whose pairwise error overlap would give a
    /// combination weight outside [0, 1].
    ///
    /// This runs over every pair of same-quantity measurements, not just
    /// pairs with declared correlations: systematic overlap alone can
    /// produce degenerate weights. Run automatically at the start of every
    /// fit.
    pub fn turn_off_over_correlations(&mut self) {
        for i in 0..self.measurements.len() {
            for j in i + 1..self.measurements.len() {
                if self.measurements[i].excluded() || self.measurements[j].excluded() {
                    continue;
                }
                if self.measurements[i].what() != self.measurements[j].what() {
                    continue;
                }
                let (rho, t1, t2) = {
                    let a = &self.measurements[i];
                    let b = &self.measurements[j];
                    (a.rho(b), a.total_error(), b.total_error())
                };
                let denom = t1 * t1 + t2 * t2 - 2.0 * rho * t1 * t2;
                let weight = (t2 * t2 - rho * t1 * t2) / denom;
                if !(0.0..=1.0).contains(&weight) {
                    let victim = if t1 >= t2 { i } else { j };
                    log::warn!(
                        "error overlap between `{}` and `{}` implies weight {:.3}; excluding `{}`",
                        self.measurements[i].name(),
                        self.measurements[j].name(),
                        weight,
                        self.measurements[victim].name()
                    );
                    self.measurements[victim].set_excluded(true);
                }
            }
        }
    }

    /// Run the combination fit and return per-quantity results.
    pub fn fit(&mut self) -> Result<ContextFit> {
        self.turn_off_over_correlations();

        // Numerical floor: a statistical error far below the central value
        // leaves the chi-square badly conditioned.
        for m in &mut self.measurements {
            if m.excluded() {
                continue;
            }
            let floor = STAT_FLOOR_FRACTION * m.value().abs();
            if m.stat_error() < floor {
                log::debug!(
                    "raising statistical error of `{}` from {} to {}",
                    m.name(),
                    m.stat_error(),
                    floor
                );
                m.set_stat_error(floor);
            }
        }

        let good: Vec<usize> =
            (0..self.measurements.len()).filter(|&i| !self.measurements[i].excluded()).collect();
        if good.is_empty() {
            return Err(Error::EmptyCombination("no usable measurements".into()));
        }
        for &i in &good {
            if self.measurements[i].stat_error() == 0.0 {
                return Err(Error::Validation(format!(
                    "measurement `{}` has zero statistical error",
                    self.measurements[i].name()
                )));
            }
        }

        // Parameter layout: one free parameter per quantity, then one shared
        // nuisance per distinct systematic name.
        let whats: Vec<String> = good
            .iter()
            .map(|&i| self.measurements[i].what().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let nuisances: Vec<String> = good
            .iter()
            .flat_map(|&i| self.measurements[i].systematics().iter().map(|(n, _)| n.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let what_index: BTreeMap<&str, usize> =
            whats.iter().enumerate().map(|(k, w)| (w.as_str(), k)).collect();
        let nuisance_index: BTreeMap<&str, usize> =
            nuisances.iter().enumerate().map(|(k, n)| (n.as_str(), whats.len() + k)).collect();
        let n_params = whats.len() + nuisances.len();

        let terms: Vec<Term> = good
            .iter()
            .map(|&i| {
                let m = &self.measurements[i];
                Term {
                    what: what_index[m.what()],
                    value: m.value(),
                    sigma: m.stat_error(),
                    deps: m
                        .systematics()
                        .iter()
                        .map(|(name, width)| (nuisance_index[name.as_str()], *width))
                        .collect(),
                }
            })
            .collect();
        let model = Chi2Model { terms, n_whats: whats.len(), n_params };

        // Start from the inverse-variance mean per quantity, nuisances at 0.
        let mut init = vec![0.0; n_params];
        let mut bounds = vec![(-10.0, 10.0); n_params];
        for (k, what) in whats.iter().enumerate() {
            let members: Vec<&Measurement> = good
                .iter()
                .map(|&i| &self.measurements[i])
                .filter(|m| m.what() == what.as_str())
                .collect();
            let wsum: f64 = members.iter().map(|m| 1.0 / (m.stat_error() * m.stat_error())).sum();
            init[k] = members
                .iter()
                .map(|m| m.value() / (m.stat_error() * m.stat_error()))
                .sum::<f64>()
                / wsum;
            let lo = members
                .iter()
                .map(|m| m.value() - 10.0 * m.total_error())
                .fold(f64::INFINITY, f64::min);
            let hi = members
                .iter()
                .map(|m| m.value() + 10.0 * m.total_error())
                .fold(f64::NEG_INFINITY, f64::max);
            bounds[k] = (lo, hi);
        }

        let minimizer = BoundedMinimizer::new(self.config.clone());
        let full = minimizer.minimize(&model, &init, &bounds)?;
        if !full.converged {
            log::warn!("combination fit did not converge: {}", full.message);
        }
        let variances = model.variances(None);

        // Statistical-only error: closed-form inverse-variance combination.
        // Refitting with nuisances frozen at the joint optimum is numerically
        // unstable when central values are far apart.
        let mut stat_errors: BTreeMap<String, f64> = BTreeMap::new();
        for what in &whats {
            let inv_var: f64 = good
                .iter()
                .map(|&i| &self.measurements[i])
                .filter(|m| m.what() == what.as_str())
                .map(|m| 1.0 / (m.stat_error() * m.stat_error()))
                .sum();
            stat_errors.insert(what.clone(), (1.0 / inv_var).sqrt());
        }

        // Per-systematic contributions: refit with one nuisance frozen at 0,
        // take the quadrature difference of errors; the sign follows the
        // central-value shift the freeze causes.
        let mut breakdowns: BTreeMap<String, BTreeMap<String, f64>> =
            whats.iter().map(|w| (w.clone(), BTreeMap::new())).collect();
        for (j, name) in nuisances.iter().enumerate() {
            let q = whats.len() + j;
            let mut frozen_bounds = bounds.clone();
            frozen_bounds[q] = (0.0, 0.0);
            let mut warm = full.parameters.clone();
            warm[q] = 0.0;
            let frozen_fit = minimizer.minimize(&model, &warm, &frozen_bounds)?;
            let frozen_variances = model.variances(Some(q));

            for (k, what) in whats.iter().enumerate() {
                let relevant = model
                    .terms
                    .iter()
                    .any(|t| t.what == k && t.deps.iter().any(|&(p, _)| p == q));
                if !relevant {
                    continue;
                }
                let err_full = variances[k].sqrt();
                let err_frozen = frozen_variances[k].sqrt();
                let d2 = err_full * err_full - err_frozen * err_frozen;
                let magnitude = d2.abs().sqrt();
                let shift = full.parameters[k] - frozen_fit.parameters[k];
                let contribution = if shift < 0.0 { -magnitude } else { magnitude };
                if let Some(breakdown) = breakdowns.get_mut(what) {
                    breakdown.insert(name.clone(), contribution);
                }
            }
        }

        // Goodness of fit, BLUE closed form over the measurement covariance.
        let quality = self.goodness_of_fit(&good, &whats, &what_index, &full.parameters);

        // Assemble results; synthetic statistical-correlation systematics
        // are folded back into the statistical error so the bookkeeping
        // never leaks into user-visible output.
        let mut results = BTreeMap::new();
        for (k, what) in whats.iter().enumerate() {
            let mut systematics = breakdowns.remove(what).unwrap_or_default();
            let mut stat = stat_errors[what];
            let synthetic_names: Vec<String> =
                systematics.keys().filter(|n| self.synthetic.contains(*n)).cloned().collect();
            for name in synthetic_names {
                let shared = systematics.remove(&name).unwrap_or(0.0);
                stat = (stat * stat + shared * shared).sqrt();
            }

            let total_error = variances[k].sqrt();
            let sys2: f64 = systematics.values().map(|v| v * v).sum();
            let closure = stat * stat + sys2 - total_error * total_error;
            if closure.abs() > CLOSURE_TOLERANCE {
                log::warn!(
                    "error decomposition for `{}` does not close: stat^2 + sys^2 - total^2 = {:.4}",
                    what,
                    closure
                );
            }

            results.insert(
                what.clone(),
                CombinedValue {
                    central_value: full.parameters[k],
                    stat_error: stat,
                    total_error,
                    systematics,
                    converged: full.converged,
                },
            );
        }

        Ok(ContextFit { results, quality, converged: full.converged })
    }

    /// Global chi-square `(fit - data)^T W^-1 (fit - data)` with `W` built
    /// from pairwise measurement covariances.
    fn goodness_of_fit(
        &self,
        good: &[usize],
        whats: &[String],
        what_index: &BTreeMap<&str, usize>,
        parameters: &[f64],
    ) -> FitQuality {
        let n = good.len();
        let ndof = n.saturating_sub(whats.len());

        let mut w = DMatrix::zeros(n, n);
        for (a, &i) in good.iter().enumerate() {
            for (b, &j) in good.iter().enumerate() {
                let mi = &self.measurements[i];
                let mj = &self.measurements[j];
                w[(a, b)] = if i == j { mi.covar(mi) } else { mi.covar(mj) };
            }
        }
        let residual = nalgebra::DVector::from_iterator(
            n,
            good.iter().map(|&i| {
                let m = &self.measurements[i];
                parameters[what_index[m.what()]] - m.value()
            }),
        );

        let chi2 = match w.lu().solve(&residual) {
            Some(solved) => residual.dot(&solved),
            None => {
                log::warn!("measurement covariance matrix is singular; chi2 unavailable");
                f64::NAN
            }
        };
        let p_value = if ndof > 0 && chi2.is_finite() && chi2 >= 0.0 {
            1.0 - gamma_lr(ndof as f64 / 2.0, chi2 / 2.0)
        } else {
            f64::NAN
        };
        FitQuality { chi2, ndof, p_value }
    }
}

/// One measurement's term in the chi-square.
struct Term {
    what: usize,
    value: f64,
    sigma: f64,
    deps: Vec<(usize, f64)>,
}

/// The joint objective: half the total chi-square.
///
/// `chi2 = sum_i ((v_i - mu_wi - sum_j theta_j W_ij) / sigma_i)^2
///         + sum_j theta_j^2`
struct Chi2Model {
    terms: Vec<Term>,
    n_whats: usize,
    n_params: usize,
}

impl Chi2Model {
    fn residual(&self, term: &Term, params: &[f64]) -> f64 {
        let mut model = params[term.what];
        for &(p, width) in &term.deps {
            model += params[p] * width;
        }
        term.value - model
    }

    /// Exact Hessian of the objective (the model is linear in every
    /// parameter, so this is constant in parameter space).
    fn hessian(&self) -> DMatrix<f64> {
        let mut h = DMatrix::zeros(self.n_params, self.n_params);
        for term in &self.terms {
            let inv_var = 1.0 / (term.sigma * term.sigma);
            let mut grads: Vec<(usize, f64)> = Vec::with_capacity(term.deps.len() + 1);
            grads.push((term.what, 1.0));
            grads.extend(term.deps.iter().copied());
            for &(a, ga) in &grads {
                for &(b, gb) in &grads {
                    h[(a, b)] += ga * gb * inv_var;
                }
            }
        }
        for j in self.n_whats..self.n_params {
            h[(j, j)] += 1.0;
        }
        h
    }

    /// Parameter variances from the inverse Hessian, optionally with one
    /// parameter removed (frozen). Falls back to the diagonal approximation
    /// if the Hessian cannot be inverted.
    fn variances(&self, frozen: Option<usize>) -> Vec<f64> {
        let h = self.hessian();
        let keep: Vec<usize> = (0..self.n_params).filter(|&i| Some(i) != frozen).collect();
        let mut reduced = DMatrix::zeros(keep.len(), keep.len());
        for (a, &i) in keep.iter().enumerate() {
            for (b, &j) in keep.iter().enumerate() {
                reduced[(a, b)] = h[(i, j)];
            }
        }

        let mut variances = vec![0.0; self.n_params];
        match invert_spd(&reduced) {
            Some(cov) => {
                for (a, &i) in keep.iter().enumerate() {
                    variances[i] = cov[(a, a)].max(0.0);
                }
            }
            None => {
                log::warn!("Hessian inversion failed; using diagonal approximation");
                for (a, &i) in keep.iter().enumerate() {
                    variances[i] = 1.0 / reduced[(a, a)].abs().max(1e-12);
                }
            }
        }
        variances
    }
}

impl Objective for Chi2Model {
    fn value(&self, params: &[f64]) -> Result<f64> {
        let mut chi2 = 0.0;
        for term in &self.terms {
            let r = self.residual(term, params);
            chi2 += r * r / (term.sigma * term.sigma);
        }
        for &theta in &params[self.n_whats..] {
            chi2 += theta * theta;
        }
        Ok(0.5 * chi2)
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; self.n_params];
        for term in &self.terms {
            let scaled = self.residual(term, params) / (term.sigma * term.sigma);
            grad[term.what] -= scaled;
            for &(p, width) in &term.deps {
                grad[p] -= scaled * width;
            }
        }
        for j in self.n_whats..self.n_params {
            grad[j] += params[j];
        }
        Ok(grad)
    }
}

/// Invert a symmetric positive-definite matrix by Cholesky, escalating the
/// diagonal damping when the numerical Hessian is slightly indefinite; LU as
/// a last resort, rejected if it produces non-positive variances.
fn invert_spd(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = matrix.nrows();
    if n == 0 {
        return Some(matrix.clone());
    }
    let identity = DMatrix::identity(n, n);
    let diag_scale = (0..n).map(|i| matrix[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut damped = matrix.clone();
    let mut damping = 0.0_f64;
    for attempt in 0..10 {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(damped.clone()) {
            return Some(chol.solve(&identity));
        }
        if attempt == 9 {
            break;
        }
        let next = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        let add = next - damping;
        for i in 0..n {
            damped[(i, i)] += add;
        }
        damping = next;
    }

    let cov = damped.lu().try_inverse()?;
    for i in 0..n {
        let v = cov[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            return None;
        }
    }
    Some(cov)
}
