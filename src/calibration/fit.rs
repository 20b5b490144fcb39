//! Fitting the counts-to-flux conversion as a function of elevation.

use itertools::{izip, Itertools};
use log::{debug, trace};

use crate::{
    constants::{DEFAULT_CLIP_SIGMA, HUBER_T, MAD_TO_SIGMA, MIN_CALIBRATION_POINTS},
    error::ReductionWarning,
    util::{mad, mean, median, std_dev},
};

/// Conversion factor (Jy per count, or Jy/sr per count) versus elevation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConversionFunction {
    /// `intercept + slope * elevation`
    Linear {
        /// value at zero elevation
        intercept: f64,
        /// change per radian of elevation
        slope: f64,
        /// standard error of the intercept
        intercept_err: f64,
        /// standard error of the slope
        slope_err: f64,
    },
    /// The same factor at every elevation.
    Constant {
        /// conversion factor
        value: f64,
        /// its uncertainty
        error: f64,
    },
}

impl ConversionFunction {
    /// Conversion factor and uncertainty at `elevation_rad`.
    pub fn predict(&self, elevation_rad: f64) -> (f64, f64) {
        match *self {
            Self::Linear {
                intercept,
                slope,
                intercept_err,
                slope_err,
            } => (
                intercept + slope * elevation_rad,
                (intercept_err.powi(2) + (slope_err * elevation_rad).powi(2)).sqrt(),
            ),
            Self::Constant { value, error } => (value, error),
        }
    }
}

/// A strategy for fitting a [`ConversionFunction`] to calibrator points.
pub trait ConversionFit {
    /// Fit `ratio ± ratio_err` against `elevation`. All slices have the same
    /// length and at least one finite point.
    fn fit(
        &self,
        elevation: &[f64],
        ratio: &[f64],
        ratio_err: &[f64],
        warnings: &mut Vec<ReductionWarning>,
    ) -> ConversionFunction;
}

/// Sigma-clipped mean, ignoring elevation.
///
/// Starts from the median, rejects points more than `clip_sigma` robust
/// sigmas away, and refits as the mean of the remaining points until the
/// kept set stops changing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterativeClippedConstantFit {
    /// rejection threshold in sigmas
    pub clip_sigma: f64,
    /// fewer kept points than this and the fit is declared shaky
    pub min_points: usize,
    /// upper bound on clipping rounds
    pub max_iterations: usize,
}

impl Default for IterativeClippedConstantFit {
    fn default() -> Self {
        Self {
            clip_sigma: DEFAULT_CLIP_SIGMA,
            min_points: MIN_CALIBRATION_POINTS,
            max_iterations: 100,
        }
    }
}

impl ConversionFit for IterativeClippedConstantFit {
    fn fit(
        &self,
        _elevation: &[f64],
        ratio: &[f64],
        ratio_err: &[f64],
        warnings: &mut Vec<ReductionWarning>,
    ) -> ConversionFunction {
        let mut kept = ratio.iter().map(|r| r.is_finite()).collect_vec();
        let mut value = median(ratio);

        for iteration in 0..self.max_iterations {
            let num_kept = kept.iter().filter(|&&k| k).count();
            if num_kept < self.min_points {
                warnings.push(
                    ReductionWarning::unreliable(
                        "clipped constant fit",
                        format!("only {num_kept} points left, the fit is shaky"),
                    )
                    .emit(),
                );
                break;
            }

            let residuals = izip!(ratio, &kept)
                .filter(|(_, &k)| k)
                .map(|(r, _)| r - value)
                .collect_vec();
            let mut sigma = MAD_TO_SIGMA * mad(&residuals);
            if !(sigma > 0.0) {
                sigma = std_dev(&residuals);
            }
            let threshold = self.clip_sigma * sigma;

            let new_kept = ratio
                .iter()
                .map(|r| r.is_finite() && (r - value).abs() <= threshold)
                .collect_vec();
            let kept_ratios = izip!(ratio, &new_kept)
                .filter(|(_, &k)| k)
                .map(|(r, _)| *r)
                .collect_vec();
            if kept_ratios.is_empty() {
                break;
            }
            value = mean(&kept_ratios);
            let stable = new_kept == kept;
            kept = new_kept;
            trace!(
                "clip iteration {iteration}: value {value}, sigma {sigma}, {} kept",
                kept_ratios.len()
            );
            if stable {
                break;
            }
        }

        let kept_ratios = izip!(ratio, &kept)
            .filter(|(_, &k)| k)
            .map(|(r, _)| *r)
            .collect_vec();
        let error = if kept_ratios.len() > 1 {
            std_dev(&kept_ratios)
        } else {
            izip!(ratio_err, &kept)
                .find(|(_, &k)| k)
                .map_or(f64::NAN, |(e, _)| *e)
        };
        debug!(
            "clipped constant fit: {value} ± {error} from {} of {} points",
            kept_ratios.len(),
            ratio.len()
        );
        ConversionFunction::Constant { value, error }
    }
}

/// Straight line in elevation fit by iteratively reweighted least squares
/// with Huber weights, so that a few bad calibrator points cannot drag the
/// line around.
///
/// Falls back to `fallback` with fewer than `min_points` (and never fewer
/// than 3) points, without an elevation lever arm, or when the normal
/// equations are singular.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustLinearFit {
    /// Huber tuning constant, in units of the residual scale
    pub huber_t: f64,
    /// fewer points than this use the fallback
    pub min_points: usize,
    /// upper bound on reweighting rounds
    pub max_iterations: usize,
    /// used when a line cannot be fit
    pub fallback: IterativeClippedConstantFit,
}

impl Default for RobustLinearFit {
    fn default() -> Self {
        Self {
            huber_t: HUBER_T,
            min_points: MIN_CALIBRATION_POINTS,
            max_iterations: 100,
            fallback: IterativeClippedConstantFit::default(),
        }
    }
}

/// Weighted least squares line `y = a + b x`. Returns `(a, b, det, sw, swxx)`,
/// or `None` if the normal equations are singular.
fn weighted_line(x: &[f64], y: &[f64], w: &[f64]) -> Option<(f64, f64, f64, f64, f64)> {
    let (mut sw, mut swx, mut swxx, mut swy, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (&x, &y, &w) in izip!(x, y, w) {
        sw += w;
        swx += w * x;
        swxx += w * x * x;
        swy += w * y;
        swxy += w * x * y;
    }
    let det = sw * swxx - swx * swx;
    if !(det > 1e-12 * sw * swxx.max(f64::MIN_POSITIVE)) {
        return None;
    }
    let slope = (sw * swxy - swx * swy) / det;
    let intercept = (swy - slope * swx) / sw;
    Some((intercept, slope, det, sw, swxx))
}

impl ConversionFit for RobustLinearFit {
    fn fit(
        &self,
        elevation: &[f64],
        ratio: &[f64],
        ratio_err: &[f64],
        warnings: &mut Vec<ReductionWarning>,
    ) -> ConversionFunction {
        let (x, y): (Vec<f64>, Vec<f64>) = izip!(elevation, ratio)
            .filter(|(e, r)| e.is_finite() && r.is_finite())
            .map(|(e, r)| (*e, *r))
            .unzip();
        let num_points = x.len();
        let (min_el, max_el) = x
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &e| (lo.min(e), hi.max(e)));

        // the residual variance needs a degree of freedom beyond the line
        if num_points < self.min_points.max(3) || !(max_el > min_el) {
            debug!("robust linear fit: {num_points} points without lever arm, using a constant");
            return self.fallback.fit(elevation, ratio, ratio_err, warnings);
        }

        let mut weights = vec![1.0; num_points];
        let Some(mut solution) = weighted_line(&x, &y, &weights) else {
            return self.fallback.fit(elevation, ratio, ratio_err, warnings);
        };

        for iteration in 0..self.max_iterations {
            let (intercept, slope, ..) = solution;
            let residuals = izip!(&x, &y)
                .map(|(x, y)| y - (intercept + slope * x))
                .collect_vec();
            let scale = MAD_TO_SIGMA * mad(&residuals);
            if !(scale > 0.0) {
                // the line already goes through at least half of the points
                break;
            }
            for (w, r) in weights.iter_mut().zip(&residuals) {
                let u = (r / scale).abs();
                *w = if u <= self.huber_t { 1.0 } else { self.huber_t / u };
            }
            let Some(next) = weighted_line(&x, &y, &weights) else {
                return self.fallback.fit(elevation, ratio, ratio_err, warnings);
            };
            let converged = (next.0 - intercept).abs() <= 1e-10 * (1.0 + intercept.abs())
                && (next.1 - slope).abs() <= 1e-10 * (1.0 + slope.abs());
            solution = next;
            if converged {
                trace!("robust linear fit converged after {iteration} iterations");
                break;
            }
        }

        let (intercept, slope, det, sw, swxx) = solution;
        let weighted_sq = izip!(&x, &y, &weights)
            .map(|(x, y, w)| w * (y - (intercept + slope * x)).powi(2))
            .sum::<f64>();
        let s2 = weighted_sq / (num_points - 2) as f64;
        let function = ConversionFunction::Linear {
            intercept,
            slope,
            intercept_err: (s2 * swxx / det).sqrt(),
            slope_err: (s2 * sw / det).sqrt(),
        };
        debug!("robust linear fit: {function:?} from {num_points} points");
        function
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_clipped_fit_rejects_outlier() {
        let mut ratio = vec![0.99; 10];
        ratio.extend(vec![1.01; 10]);
        ratio.push(2.0);
        let errors = vec![0.01; ratio.len()];
        let mut warnings = vec![];
        let function =
            IterativeClippedConstantFit::default().fit(&[], &ratio, &errors, &mut warnings);
        let (value, error) = function.predict(0.7);
        assert_abs_diff_eq!(value, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(error, 0.01, epsilon = 1e-12);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_clipped_fit_few_points_is_shaky() {
        let mut warnings = vec![];
        let function = IterativeClippedConstantFit::default().fit(
            &[],
            &[1.0, 3.0],
            &[0.1, 0.1],
            &mut warnings,
        );
        assert_eq!(function.predict(0.0).0, 2.0);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_linear_fit_constant_ratio() {
        let elevation = [0.2, 0.4, 0.6, 0.8, 1.0, 1.2];
        let ratio = [3.5; 6];
        let mut warnings = vec![];
        let function =
            RobustLinearFit::default().fit(&elevation, &ratio, &[0.0; 6], &mut warnings);
        for el in [0.1, 0.5, 1.5] {
            let (value, error) = function.predict(el);
            assert_abs_diff_eq!(value, 3.5, epsilon = 1e-12);
            assert_abs_diff_eq!(error, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_linear_fit_ignores_outlier() {
        let elevation = (0..12).map(|i| 0.1 * i as f64).collect_vec();
        let mut ratio = elevation
            .iter()
            .enumerate()
            .map(|(i, el)| 2.0 + 0.5 * el + if i % 2 == 0 { 1e-3 } else { -1e-3 })
            .collect_vec();
        ratio[5] += 1.0;
        let mut warnings = vec![];
        let function =
            RobustLinearFit::default().fit(&elevation, &ratio, &[1e-3; 12], &mut warnings);
        let ConversionFunction::Linear { intercept, slope, .. } = function else {
            panic!("expected a linear fit, got {function:?}");
        };
        assert_abs_diff_eq!(intercept, 2.0, epsilon = 0.01);
        assert_abs_diff_eq!(slope, 0.5, epsilon = 0.02);
    }

    #[test]
    fn test_linear_fit_falls_back_without_lever_arm() {
        let mut warnings = vec![];
        let function = RobustLinearFit::default().fit(
            &[0.5; 6],
            &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            &[0.1; 6],
            &mut warnings,
        );
        assert!(matches!(function, ConversionFunction::Constant { .. }));
        let function =
            RobustLinearFit::default().fit(&[0.1, 0.2], &[1.0, 2.0], &[0.1; 2], &mut warnings);
        assert!(matches!(function, ConversionFunction::Constant { .. }));
    }

    #[test]
    fn test_linear_fit_needs_three_points() {
        let fitter = RobustLinearFit {
            min_points: 2,
            ..Default::default()
        };
        let mut warnings = vec![];
        let function = fitter.fit(&[0.1, 0.3], &[1.0, 2.0], &[0.1; 2], &mut warnings);
        assert!(matches!(function, ConversionFunction::Constant { .. }));
        let (value, error) = function.predict(0.2);
        assert_abs_diff_eq!(value, 1.5, epsilon = 1e-12);
        assert!(error.is_finite());
    }
}
