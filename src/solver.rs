//! Damped Gauss-Newton solver for the registration problem.
//!
//! The cost is small (6 parameters, a few thousand residuals), so dense
//! normal equations with a Cholesky solve per iteration are plenty. The
//! iteration budget, not wall clock, bounds the work.

use nalgebra::{DMatrix, DVector};

use crate::config::SolverConfig;
use crate::cost::{CostFunction, NUM_PARAMS};

/// Outcome of one solve.
#[derive(Clone, Copy, Debug)]
pub struct SolverSummary {
    /// Whether the solution can be applied to the trajectory.
    pub usable: bool,
    /// Iterations actually performed.
    pub iterations: usize,
    /// Cost at the initial error vector.
    pub initial_cost: f64,
    /// Cost at the returned error vector.
    pub final_cost: f64,
}

impl SolverSummary {
    fn failed() -> Self {
        Self {
            usable: false,
            iterations: 0,
            initial_cost: f64::INFINITY,
            final_cost: f64::INFINITY,
        }
    }
}

/// Minimize `0.5 * |r(x)|^2` in place, starting from the given `x`.
pub fn solve(cost: &dyn CostFunction, x: &mut [f64], config: &SolverConfig) -> SolverSummary {
    assert_eq!(x.len(), NUM_PARAMS);
    let n = cost.num_residuals();
    if n == 0 {
        return SolverSummary::failed();
    }

    let mut residuals = DVector::zeros(n);
    let mut jacobian = DMatrix::zeros(n, NUM_PARAMS);

    let mut initial_cost = f64::INFINITY;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        if !cost.evaluate(x, residuals.as_mut_slice(), Some(&mut jacobian)) {
            return SolverSummary::failed();
        }
        if iter == 0 {
            initial_cost = 0.5 * residuals.norm_squared();
        }

        // Normal equations with constant damping on the diagonal.
        let mut h = jacobian.transpose() * &jacobian;
        for k in 0..NUM_PARAMS {
            h[(k, k)] += config.damping;
        }
        let g = jacobian.transpose() * &residuals;

        let Some(chol) = h.cholesky() else {
            log::warn!("normal equations not positive definite, aborting solve");
            return SolverSummary::failed();
        };
        let dx = chol.solve(&(-g));

        for (xi, di) in x.iter_mut().zip(dx.iter()) {
            *xi += di;
        }
        iterations = iter + 1;

        if dx.norm() < config.param_tol {
            break;
        }
    }

    if !cost.evaluate(x, residuals.as_mut_slice(), None) {
        return SolverSummary::failed();
    }
    let final_cost = 0.5 * residuals.norm_squared();

    SolverSummary {
        usable: final_cost.is_finite() && final_cost <= initial_cost,
        iterations,
        initial_cost,
        final_cost,
    }
}
