//! Unconstrained minimisation with BFGS and numerical gradients.

use log::{debug, trace};
use ndarray::{Array1, Array2};

/// Outcome of a minimisation. Non-convergence is reported, not raised; `x`
/// always holds the best parameters found.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimization {
    /// best parameters
    pub x: Vec<f64>,
    /// objective at `x`
    pub fun: f64,
    /// objective at the starting point
    pub fun_start: f64,
    /// number of iterations performed
    pub iterations: usize,
    /// number of objective evaluations
    pub evaluations: usize,
    /// whether the gradient tolerance was reached
    pub converged: bool,
}

/// Quasi-Newton minimiser with an inverse-Hessian BFGS update, central
/// difference gradients and a backtracking (Armijo) line search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bfgs {
    /// upper bound on iterations
    pub max_iterations: usize,
    /// converged once every gradient component is below this
    pub gradient_tolerance: f64,
    /// relative step of the finite differences
    pub difference_step: f64,
}

impl Default for Bfgs {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            gradient_tolerance: 1e-6,
            difference_step: 1e-6,
        }
    }
}

struct Objective<F> {
    func: F,
    evaluations: usize,
}

impl<F: FnMut(&[f64]) -> f64> Objective<F> {
    fn value(&mut self, x: &Array1<f64>) -> f64 {
        self.evaluations += 1;
        match x.as_slice() {
            Some(x) => (self.func)(x),
            None => (self.func)(&x.to_vec()),
        }
    }

    fn gradient(&mut self, x: &Array1<f64>, step: f64) -> Array1<f64> {
        let mut shifted = x.clone();
        Array1::from_shape_fn(x.len(), |idx| {
            let h = step * x[idx].abs().max(1.0);
            shifted[idx] = x[idx] + h;
            let forward = self.value(&shifted);
            shifted[idx] = x[idx] - h;
            let backward = self.value(&shifted);
            shifted[idx] = x[idx];
            (forward - backward) / (2.0 * h)
        })
    }
}

impl Bfgs {
    /// Minimise `func` starting from `x0`.
    ///
    /// `on_iteration` is called after every iteration with the iteration
    /// number and the current objective, e.g. to drive a progress bar.
    pub fn minimize<F, C>(&self, func: F, x0: &[f64], mut on_iteration: C) -> Minimization
    where
        F: FnMut(&[f64]) -> f64,
        C: FnMut(usize, f64),
    {
        let num_params = x0.len();
        let mut objective = Objective {
            func,
            evaluations: 0,
        };
        let mut x = Array1::from_vec(x0.to_vec());
        let mut fx = objective.value(&x);
        let fun_start = fx;
        if num_params == 0 || !fx.is_finite() {
            return Minimization {
                x: x.to_vec(),
                fun: fx,
                fun_start,
                iterations: 0,
                evaluations: objective.evaluations,
                converged: num_params == 0,
            };
        }

        let identity = Array2::<f64>::eye(num_params);
        let mut inv_hessian = identity.clone();
        let mut fresh_hessian = true;
        let mut grad = objective.gradient(&x, self.difference_step);
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.max_iterations {
            if grad.iter().all(|g| g.abs() < self.gradient_tolerance) {
                converged = true;
                break;
            }
            iterations += 1;

            let mut direction = -inv_hessian.dot(&grad);
            let mut slope = grad.dot(&direction);
            if !(slope < 0.0) {
                // not a descent direction, restart from steepest descent
                inv_hessian = identity.clone();
                fresh_hessian = true;
                direction = -&grad;
                slope = grad.dot(&direction);
            }

            let mut alpha = 1.0;
            let mut accepted = None;
            while alpha > 1e-20 {
                let candidate = &x + &(&direction * alpha);
                let f_candidate = objective.value(&candidate);
                if f_candidate.is_finite() && f_candidate <= fx + 1e-4 * alpha * slope {
                    accepted = Some((candidate, f_candidate));
                    break;
                }
                alpha *= 0.5;
            }
            let Some((x_new, f_new)) = accepted else {
                on_iteration(iterations, fx);
                if fresh_hessian {
                    debug!("bfgs: line search failed along steepest descent, stopping");
                    break;
                }
                inv_hessian = identity.clone();
                fresh_hessian = true;
                continue;
            };

            let grad_new = objective.gradient(&x_new, self.difference_step);
            let s = &x_new - &x;
            let y = &grad_new - &grad;
            let sy = s.dot(&y);
            if sy > 1e-12 * s.dot(&s).sqrt() * y.dot(&y).sqrt() {
                if fresh_hessian {
                    inv_hessian = &identity * (sy / y.dot(&y));
                }
                let hy = inv_hessian.dot(&y);
                let yhy = y.dot(&hy);
                let coeff = (sy + yhy) / (sy * sy);
                for ((i, j), h) in inv_hessian.indexed_iter_mut() {
                    *h += coeff * s[i] * s[j] - (hy[i] * s[j] + s[i] * hy[j]) / sy;
                }
                fresh_hessian = false;
            }

            x = x_new;
            fx = f_new;
            grad = grad_new;
            trace!("bfgs iteration {iterations}: f = {fx:e}");
            on_iteration(iterations, fx);
        }

        debug!(
            "bfgs: f {fun_start:e} -> {fx:e} in {iterations} iterations ({} evaluations), converged: {converged}",
            objective.evaluations
        );
        Minimization {
            x: x.to_vec(),
            fun: fx,
            fun_start,
            iterations,
            evaluations: objective.evaluations,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_quadratic() {
        let result = Bfgs::default().minimize(
            |x| (x[0] - 3.0).powi(2) + 10.0 * (x[1] + 1.0).powi(2) + x[0] * x[1],
            &[0.0, 0.0],
            |_, _| {},
        );
        // gradient zero at 2 (x0 - 3) + x1 = 0, 20 (x1 + 1) + x0 = 0
        assert!(result.converged);
        assert_abs_diff_eq!(result.x[0], 3.589_743_589_743_59, epsilon = 1e-5);
        assert_abs_diff_eq!(result.x[1], -1.179_487_179_487_18, epsilon = 1e-5);
        assert!(result.fun < result.fun_start);
    }

    #[test]
    fn test_rosenbrock() {
        let mut calls = 0;
        let result = Bfgs {
            max_iterations: 1000,
            ..Default::default()
        }
        .minimize(
            |x| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0].powi(2)).powi(2),
            &[-1.2, 1.0],
            |_, _| calls += 1,
        );
        assert_abs_diff_eq!(result.x[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(result.x[1], 1.0, epsilon = 1e-3);
        assert_eq!(calls, result.iterations);
    }

    #[test]
    fn test_iteration_limit_is_not_an_error() {
        let result = Bfgs {
            max_iterations: 1,
            ..Default::default()
        }
        .minimize(
            |x| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0].powi(2)).powi(2),
            &[-1.2, 1.0],
            |_, _| {},
        );
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
        assert!(result.fun <= result.fun_start);
    }
}
