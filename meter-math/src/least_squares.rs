//! Levenberg–Marquardt nonlinear least squares.
//!
//! Minimizes `‖r(p)‖²` for a residual function `r: ℝⁿ → ℝᵐ` with a
//! central-difference Jacobian. Intended for small problems (a handful of
//! parameters, tens of residuals) where forming `JᵀJ` densely is cheap.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors from the solver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error("residual function returned a non-finite value")]
    NonFinite,

    #[error("no convergence after {iterations} iterations (cost {cost:e})")]
    NonConvergence { iterations: usize, cost: f64 },
}

/// Solver tuning.
#[derive(Debug, Clone)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Starting damping factor
    pub initial_lambda: f64,
    /// Stop when a step reduces the cost by less than this fraction
    pub cost_tolerance: f64,
    /// Stop when the step is this small relative to the parameters
    pub step_tolerance: f64,
    /// Stop when every gradient component is below this
    pub gradient_tolerance: f64,
    /// Relative finite-difference step for the Jacobian
    pub jacobian_step: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            initial_lambda: 1e-3,
            cost_tolerance: 1e-14,
            step_tolerance: 1e-12,
            gradient_tolerance: 1e-16,
            jacobian_step: 1e-7,
        }
    }
}

/// Outcome of a converged solve.
#[derive(Debug, Clone)]
pub struct LmReport {
    pub params: DVector<f64>,
    /// Final sum of squared residuals
    pub cost: f64,
    pub iterations: usize,
}

fn evaluate<F>(residuals: &F, params: &DVector<f64>) -> Result<DVector<f64>, SolverError>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let r = residuals(params);
    if r.iter().all(|x| x.is_finite()) {
        Ok(r)
    } else {
        Err(SolverError::NonFinite)
    }
}

fn jacobian<F>(
    residuals: &F,
    params: &DVector<f64>,
    rows: usize,
    rel_step: f64,
) -> Result<DMatrix<f64>, SolverError>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let mut j = DMatrix::zeros(rows, params.len());
    let mut shifted = params.clone();
    for col in 0..params.len() {
        let h = rel_step * params[col].abs().max(1.0);
        shifted[col] = params[col] + h;
        let plus = evaluate(residuals, &shifted)?;
        shifted[col] = params[col] - h;
        let minus = evaluate(residuals, &shifted)?;
        shifted[col] = params[col];
        j.set_column(col, &((plus - minus) / (2.0 * h)));
    }
    Ok(j)
}

/// Minimize `‖residuals(p)‖²` starting from `initial`.
///
/// Returns [`SolverError::NonConvergence`] if no stopping criterion is met
/// within `config.max_iterations`.
pub fn levenberg_marquardt<F>(
    residuals: F,
    initial: DVector<f64>,
    config: &LmConfig,
) -> Result<LmReport, SolverError>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    if initial.is_empty() {
        return Err(SolverError::ArgumentError("no parameters".to_string()));
    }

    let mut params = initial;
    let mut r = evaluate(&residuals, &params)?;
    if r.len() < params.len() {
        return Err(SolverError::ArgumentError(format!(
            "{} residuals cannot determine {} parameters",
            r.len(),
            params.len()
        )));
    }
    let mut cost = r.norm_squared();
    let mut lambda = config.initial_lambda;

    for iteration in 1..=config.max_iterations {
        if cost == 0.0 {
            return Ok(LmReport {
                params,
                cost,
                iterations: iteration - 1,
            });
        }

        let j = jacobian(&residuals, &params, r.len(), config.jacobian_step)?;
        let jtj = j.transpose() * &j;
        let gradient = j.transpose() * &r;
        if gradient.amax() <= config.gradient_tolerance {
            log::trace!("LM: gradient vanished after {} iterations", iteration - 1);
            return Ok(LmReport {
                params,
                cost,
                iterations: iteration - 1,
            });
        }

        // Retry with increasing damping until a step lowers the cost.
        loop {
            let mut damped = jtj.clone();
            for k in 0..damped.nrows() {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }

            let step = match damped.cholesky() {
                Some(chol) => chol.solve(&(-&gradient)),
                None => {
                    lambda *= 10.0;
                    if lambda > 1e16 {
                        return Ok(LmReport {
                            params,
                            cost,
                            iterations: iteration,
                        });
                    }
                    continue;
                }
            };

            let candidate = &params + &step;
            let candidate_r = evaluate(&residuals, &candidate)?;
            let candidate_cost = candidate_r.norm_squared();

            if candidate_cost < cost {
                let improvement = cost - candidate_cost;
                let small_step =
                    step.norm() <= config.step_tolerance * (params.norm() + config.step_tolerance);
                params = candidate;
                r = candidate_r;
                let previous = cost;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-15);

                if improvement <= config.cost_tolerance * previous || small_step {
                    return Ok(LmReport {
                        params,
                        cost,
                        iterations: iteration,
                    });
                }
                break;
            }

            lambda *= 10.0;
            if lambda > 1e16 {
                // No descent direction left at this precision: a minimum.
                return Ok(LmReport {
                    params,
                    cost,
                    iterations: iteration,
                });
            }
        }
    }

    log::debug!(
        "LM: giving up after {} iterations, cost {:e}",
        config.max_iterations,
        cost
    );
    Err(SolverError::NonConvergence {
        iterations: config.max_iterations,
        cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_fit() {
        // y = 2x + 1
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let residuals = |p: &DVector<f64>| {
            DVector::from_iterator(xs.len(), xs.iter().map(|x| p[0] * x + p[1] - (2.0 * x + 1.0)))
        };
        let report =
            levenberg_marquardt(residuals, DVector::from_vec(vec![0.0, 0.0]), &LmConfig::default())
                .unwrap();
        assert_relative_eq!(report.params[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(report.params[1], 1.0, epsilon = 1e-8);
        assert!(report.cost < 1e-14);
    }

    #[test]
    fn test_rosenbrock() {
        let residuals =
            |p: &DVector<f64>| DVector::from_vec(vec![10.0 * (p[1] - p[0] * p[0]), 1.0 - p[0]]);
        let report = levenberg_marquardt(
            residuals,
            DVector::from_vec(vec![-1.2, 1.0]),
            &LmConfig::default(),
        )
        .unwrap();
        assert_relative_eq!(report.params[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(report.params[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_exponential_decay() {
        let ts: Vec<f64> = (0..20).map(|i| i as f64 * 0.25).collect();
        let ys: Vec<f64> = ts.iter().map(|t| 3.0 * (-0.7 * t).exp()).collect();
        let residuals = |p: &DVector<f64>| {
            DVector::from_iterator(
                ts.len(),
                ts.iter().zip(&ys).map(|(t, y)| p[0] * (-p[1] * t).exp() - y),
            )
        };
        let report =
            levenberg_marquardt(residuals, DVector::from_vec(vec![1.0, 0.1]), &LmConfig::default())
                .unwrap();
        assert_relative_eq!(report.params[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(report.params[1], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn test_iteration_budget_exhausted() {
        let residuals =
            |p: &DVector<f64>| DVector::from_vec(vec![10.0 * (p[1] - p[0] * p[0]), 1.0 - p[0]]);
        let config = LmConfig {
            max_iterations: 1,
            ..LmConfig::default()
        };
        let result = levenberg_marquardt(residuals, DVector::from_vec(vec![-1.2, 1.0]), &config);
        assert!(matches!(result, Err(SolverError::NonConvergence { .. })));
    }

    #[test]
    fn test_non_finite_residual() {
        let residuals = |p: &DVector<f64>| DVector::from_vec(vec![p[0].ln(), p[0]]);
        let result =
            levenberg_marquardt(residuals, DVector::from_vec(vec![-1.0]), &LmConfig::default());
        assert_eq!(result.unwrap_err(), SolverError::NonFinite);
    }

    #[test]
    fn test_underdetermined_rejected() {
        let residuals = |p: &DVector<f64>| DVector::from_vec(vec![p[0] + p[1]]);
        let result =
            levenberg_marquardt(residuals, DVector::from_vec(vec![0.0, 0.0]), &LmConfig::default());
        assert!(matches!(result, Err(SolverError::ArgumentError(_))));
    }
}
