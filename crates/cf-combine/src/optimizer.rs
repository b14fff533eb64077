//! Bounded quasi-Newton minimization
//!
//! Thin wrapper around argmin's L-BFGS with More-Thuente line search. Box
//! bounds are enforced by clamping the parameters before every evaluation
//! and zeroing gradient components that would push an active bound further
//! out. Clamping a parameter's bounds to a single value fixes it, which is
//! how the fit engine freezes individual nuisance parameters for refits.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use cf_core::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An objective with an analytic gradient.
///
/// The combination chi-square is linear in every parameter, so its gradient
/// is exact and cheap; there is no finite-difference fallback here.
pub trait Objective: Send + Sync {
    /// Objective value at `params`.
    fn value(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params`.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>>;
}

/// Minimizer configuration.
#[derive(Debug, Clone)]
pub struct MinimizerConfig {
    /// Iteration cap
    pub max_iter: u64,
    /// Gradient-norm convergence tolerance
    pub grad_tol: f64,
    /// L-BFGS history length
    pub memory: usize,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self { max_iter: 500, grad_tol: 1e-8, memory: 10 }
    }
}

/// Result of a minimization.
#[derive(Debug, Clone)]
pub struct Minimum {
    /// Parameters at the minimum (clamped into bounds)
    pub parameters: Vec<f64>,
    /// Objective value at the minimum
    pub value: f64,
    /// Iterations used
    pub n_iter: u64,
    /// Objective evaluations
    pub n_eval: usize,
    /// Gradient evaluations
    pub n_grad: usize,
    /// Whether the solver reported convergence
    pub converged: bool,
    /// Termination description
    pub message: String,
}

fn clamp_into(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

#[derive(Default)]
struct EvalCounts {
    value: AtomicUsize,
    grad: AtomicUsize,
}

struct BoundedProblem<'a> {
    objective: &'a dyn Objective,
    bounds: &'a [(f64, f64)],
    counts: Arc<EvalCounts>,
}

impl CostFunction for BoundedProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        self.counts.value.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_into(params, self.bounds);
        self.objective.value(&clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for BoundedProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_into(params, self.bounds);
        let mut g = self
            .objective
            .gradient(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;

        // Project out gradient components that point past an active bound;
        // the line search would otherwise keep stepping into the flat
        // clamped region and never satisfy its conditions.
        const EDGE: f64 = 1e-12;
        for (i, (&x, &(lo, hi))) in clamped.iter().zip(self.bounds.iter()).enumerate() {
            if x <= lo + EDGE && g[i] > 0.0 {
                g[i] = 0.0;
            }
            if x >= hi - EDGE && g[i] < 0.0 {
                g[i] = 0.0;
            }
        }
        Ok(g)
    }
}

/// L-BFGS minimizer with box bounds.
pub struct BoundedMinimizer {
    config: MinimizerConfig,
}

impl BoundedMinimizer {
    /// Create a minimizer with the given configuration.
    pub fn new(config: MinimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` starting from `init`, keeping every parameter
    /// inside its `(low, high)` bounds.
    pub fn minimize(
        &self,
        objective: &dyn Objective,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<Minimum> {
        if init.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "minimizer: {} initial parameters but {} bounds",
                init.len(),
                bounds.len()
            )));
        }

        let counts = Arc::new(EvalCounts::default());
        let problem =
            BoundedProblem { objective, bounds, counts: Arc::clone(&counts) };

        let linesearch = MoreThuenteLineSearch::new();
        // The default cost tolerance (machine epsilon) causes spurious
        // max-iter terminations at chi-square scales; tie it to grad_tol.
        let cost_tol = (0.1 * self.config.grad_tol).max(1e-14);
        let solver = LBFGS::new(linesearch, self.config.memory)
            .with_tolerance_grad(self.config.grad_tol)
            .map_err(|e| Error::Validation(format!("bad minimizer tolerance: {e}")))?
            .with_tolerance_cost(cost_tol)
            .map_err(|e| Error::Validation(format!("bad minimizer cost tolerance: {e}")))?;

        let init = clamp_into(init, bounds);
        let executor = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(self.config.max_iter));
        let outcome = executor
            .run()
            .map_err(|e| Error::Computation(format!("minimization failed: {e}")))?;

        let state = outcome.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("minimizer produced no parameters".into()))?;
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(Minimum {
            parameters: clamp_into(best, bounds),
            value: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_eval: counts.value.load(Ordering::Relaxed),
            n_grad: counts.grad.load(Ordering::Relaxed),
            converged,
            message: termination.to_string(),
        })
    }
}

impl Default for BoundedMinimizer {
    fn default() -> Self {
        Self::new(MinimizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // A two-measurement pull-style objective:
    //   f(mu, theta) = (1.0 - mu - 0.1*theta)^2 + (0.5 - mu)^2 + theta^2
    // mirrors the shape the fit engine produces.
    struct PullObjective;

    impl Objective for PullObjective {
        fn value(&self, p: &[f64]) -> Result<f64> {
            let (mu, theta) = (p[0], p[1]);
            let r1 = 1.0 - mu - 0.1 * theta;
            let r2 = 0.5 - mu;
            Ok(r1 * r1 + r2 * r2 + theta * theta)
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            let (mu, theta) = (p[0], p[1]);
            let r1 = 1.0 - mu - 0.1 * theta;
            let r2 = 0.5 - mu;
            Ok(vec![-2.0 * r1 - 2.0 * r2, -0.2 * r1 + 2.0 * theta])
        }
    }

    #[test]
    fn pull_objective_minimum() {
        let minimizer = BoundedMinimizer::default();
        let result = minimizer
            .minimize(&PullObjective, &[0.0, 0.0], &[(-10.0, 10.0), (-10.0, 10.0)])
            .unwrap();
        assert!(result.converged, "{}", result.message);

        // Stationarity: gradient at the reported minimum is ~0.
        let g = PullObjective.gradient(&result.parameters).unwrap();
        assert!(g.iter().all(|x| x.abs() < 1e-6), "gradient {g:?}");
        // mu lands between the two measurements.
        assert!(result.parameters[0] > 0.5 && result.parameters[0] < 1.0);
    }

    #[test]
    fn frozen_parameter_stays_frozen() {
        let minimizer = BoundedMinimizer::default();
        let result = minimizer
            .minimize(&PullObjective, &[0.0, 0.0], &[(-10.0, 10.0), (0.0, 0.0)])
            .unwrap();
        assert_eq!(result.parameters[1], 0.0);
        // With theta pinned the problem is pure least squares in mu: 0.75.
        assert_relative_eq!(result.parameters[0], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn minimum_at_bound_converges() {
        struct Shifted;
        impl Objective for Shifted {
            fn value(&self, p: &[f64]) -> Result<f64> {
                Ok((p[0] + 2.0) * (p[0] + 2.0))
            }
            fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
                Ok(vec![2.0 * (p[0] + 2.0)])
            }
        }
        let minimizer = BoundedMinimizer::default();
        let result = minimizer.minimize(&Shifted, &[5.0], &[(0.0, 10.0)]).unwrap();
        assert_relative_eq!(result.parameters[0], 0.0, epsilon = 1e-9);
        assert!(result.converged, "{}", result.message);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let minimizer = BoundedMinimizer::default();
        assert!(minimizer.minimize(&PullObjective, &[0.0], &[(0.0, 1.0), (0.0, 1.0)]).is_err());
    }
}
