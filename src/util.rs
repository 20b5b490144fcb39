//! Utility functions: robust statistics, filters and a small banded solver.

use std::ops::Range;

use itertools::Itertools;

/// The median of a slice of values, ignoring non-finite entries.
///
/// Returns NaN when there are no finite values.
///
/// # Examples
///
/// ```rust
/// use driftscan::util::median;
///
/// assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
/// assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
/// assert!(median(&[]).is_nan());
/// ```
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect::<Vec<_>>();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation around the median (not scaled to a sigma).
pub fn mad(values: &[f64]) -> f64 {
    let centre = median(values);
    let deviations = values.iter().map(|v| (v - centre).abs()).collect_vec();
    median(&deviations)
}

/// Reference MAD of an array: the median of the MADs of all windows of length
/// `window`.
///
/// A handful of outliers can only spoil the windows that contain them, so the
/// median over windows stays close to the MAD of the clean data. Arrays
/// shorter than the window fall back to a single [`mad`].
pub fn ref_mad(values: &[f64], window: usize) -> f64 {
    if window == 0 || values.len() <= window {
        return mad(values);
    }
    let mads = values.windows(window).map(mad).collect_vec();
    median(&mads)
}

/// Arithmetic mean of the finite entries, NaN if there are none.
pub fn mean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Population standard deviation of the finite entries.
pub fn std_dev(values: &[f64]) -> f64 {
    let centre = mean(values);
    let squares = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - centre).powi(2))
        .collect_vec();
    mean(&squares).sqrt()
}

/// The smallest odd number greater than or equal to `n`.
pub fn odd_at_least(n: usize) -> usize {
    if n % 2 == 0 {
        n + 1
    } else {
        n
    }
}

/// Running median with an odd `window`, replicating the edge values so that
/// the output has the same length as the input.
pub fn median_filter(values: &[f64], window: usize) -> Vec<f64> {
    let num = values.len();
    if num == 0 {
        return vec![];
    }
    let half = odd_at_least(window.max(1)) / 2;
    let mut buf = Vec::with_capacity(2 * half + 1);
    (0..num)
        .map(|idx| {
            buf.clear();
            for offset in 0..=2 * half {
                // clamp idx + offset - half into [0, num)
                let src = (idx + offset).saturating_sub(half).min(num - 1);
                buf.push(values[src]);
            }
            median(&buf)
        })
        .collect()
}

/// Ranges of contiguous `true` values in `mask`.
///
/// # Examples
///
/// ```rust
/// use driftscan::util::contiguous_regions;
///
/// let mask = [true, true, false, false, true, false, true];
/// assert_eq!(contiguous_regions(&mask), vec![0..2, 4..5, 6..7]);
/// ```
pub fn contiguous_regions(mask: &[bool]) -> Vec<Range<usize>> {
    let mut regions = vec![];
    let mut start = None;
    for (idx, &flag) in mask.iter().enumerate() {
        match (flag, start) {
            (true, None) => start = Some(idx),
            (false, Some(first)) => {
                regions.push(first..idx);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(first) = start {
        regions.push(first..mask.len());
    }
    regions
}

/// Solve a symmetric positive definite pentadiagonal system `A x = b` with a
/// banded Cholesky decomposition.
///
/// `diag`, `off1` and `off2` are the main diagonal and the first and second
/// super-diagonals of `A`. Returns `None` if `A` is not positive definite.
pub(crate) fn solve_pentadiagonal(
    diag: &[f64],
    off1: &[f64],
    off2: &[f64],
    rhs: &[f64],
) -> Option<Vec<f64>> {
    let num = diag.len();
    // l1[i] = L[i][i-1], l2[i] = L[i][i-2]
    let mut d = vec![0.0; num];
    let mut l1 = vec![0.0; num];
    let mut l2 = vec![0.0; num];
    for i in 0..num {
        if i >= 2 {
            l2[i] = off2[i - 2] / d[i - 2];
        }
        if i >= 1 {
            let coupling = if i >= 2 { l2[i] * l1[i - 1] } else { 0.0 };
            l1[i] = (off1[i - 1] - coupling) / d[i - 1];
        }
        let pivot = diag[i] - l1[i].powi(2) - l2[i].powi(2);
        if pivot <= 0.0 || !pivot.is_finite() {
            return None;
        }
        d[i] = pivot.sqrt();
    }

    let mut y = vec![0.0; num];
    for i in 0..num {
        let mut acc = rhs[i];
        if i >= 1 {
            acc -= l1[i] * y[i - 1];
        }
        if i >= 2 {
            acc -= l2[i] * y[i - 2];
        }
        y[i] = acc / d[i];
    }

    let mut x = vec![0.0; num];
    for i in (0..num).rev() {
        let mut acc = y[i];
        if i + 1 < num {
            acc -= l1[i + 1] * x[i + 1];
        }
        if i + 2 < num {
            acc -= l2[i + 2] * x[i + 2];
        }
        x[i] = acc / d[i];
    }
    Some(x)
}

/// Asymmetric least squares baseline (Eilers & Boelens 2005).
///
/// Minimises `Σ w_i (y_i - z_i)^2 + λ Σ (Δ² z_i)^2`, re-weighting with `p` for
/// points above the baseline and `1 - p` below. Small `p` makes the baseline
/// follow the lower envelope of the data, so that positive bumps (sources)
/// do not drag it upwards.
///
/// Returns `None` if the penalised system cannot be solved.
pub fn als_baseline(
    values: &[f64],
    lambda: f64,
    asymmetry: f64,
    iterations: usize,
) -> Option<Vec<f64>> {
    let num = values.len();
    if num < 3 {
        return Some(values.to_vec());
    }

    // bands of λ DᵀD for the second-difference operator D
    let mut pen0 = vec![0.0; num];
    let mut pen1 = vec![0.0; num - 1];
    let mut pen2 = vec![0.0; num - 2];
    let coeffs = [1.0, -2.0, 1.0];
    for row in 0..num - 2 {
        for a in 0..3 {
            pen0[row + a] += lambda * coeffs[a] * coeffs[a];
            for b in a + 1..3 {
                let value = lambda * coeffs[a] * coeffs[b];
                if b - a == 1 {
                    pen1[row + a] += value;
                } else {
                    pen2[row + a] += value;
                }
            }
        }
    }

    let mut weights = vec![1.0; num];
    let mut baseline = values.to_vec();
    for _ in 0..iterations.max(1) {
        let diag = pen0.iter().zip(&weights).map(|(p, w)| p + w).collect_vec();
        let rhs = values.iter().zip(&weights).map(|(y, w)| y * w).collect_vec();
        baseline = solve_pentadiagonal(&diag, &pen1, &pen2, &rhs)?;
        let new_weights = values
            .iter()
            .zip(&baseline)
            .map(|(y, z)| if y > z { asymmetry } else { 1.0 - asymmetry })
            .collect_vec();
        if new_weights == weights {
            break;
        }
        weights = new_weights;
    }
    Some(baseline)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_median_ignores_nan() {
        assert_abs_diff_eq!(median(&[1.0, f64::NAN, 3.0, 2.0]), 2.0);
    }

    #[test]
    fn test_mad() {
        // median 3, deviations [2, 1, 0, 1, 97] -> 1
        assert_abs_diff_eq!(mad(&[1.0, 2.0, 3.0, 4.0, 100.0]), 1.0);
    }

    #[test]
    fn test_ref_mad_resists_outlier_runs() {
        let mut values = (0..100)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect_vec();
        values[50..53].copy_from_slice(&[1e3, 1e3, 1e3]);
        assert_abs_diff_eq!(ref_mad(&values, 20), 1.0);
    }

    #[test]
    fn test_median_filter_edges() {
        let values = [5.0, 1.0, 1.0, 100.0, 1.0, 1.0, 5.0];
        let filtered = median_filter(&values, 3);
        assert_eq!(filtered, vec![5.0, 1.0, 1.0, 1.0, 1.0, 1.0, 5.0]);
    }

    #[test]
    fn test_median_filter_even_window_is_made_odd() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(median_filter(&values, 2), median_filter(&values, 3));
    }

    #[test]
    fn test_contiguous_regions_empty() {
        assert!(contiguous_regions(&[false, false]).is_empty());
        assert_eq!(contiguous_regions(&[true, true]), vec![0..2]);
    }

    #[test]
    fn test_solve_pentadiagonal() {
        // A = [[4,1,1,0],[1,4,1,1],[1,1,4,1],[0,1,1,4]], x = [1,2,3,4]
        let diag = [4.0, 4.0, 4.0, 4.0];
        let off1 = [1.0, 1.0, 1.0];
        let off2 = [1.0, 1.0];
        let rhs = [9.0, 16.0, 19.0, 21.0];
        let x = solve_pentadiagonal(&diag, &off1, &off2, &rhs).unwrap();
        for (got, exp) in x.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert_abs_diff_eq!(*got, exp, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_solve_pentadiagonal_not_positive_definite() {
        assert!(solve_pentadiagonal(&[1.0, -1.0], &[0.0], &[], &[1.0, 1.0]).is_none());
    }

    #[test]
    fn test_als_baseline_follows_line_under_bump() {
        let values = (0..200)
            .map(|i| {
                let x = i as f64;
                let bump = if (90..110).contains(&i) { 50.0 } else { 0.0 };
                0.5 * x + 3.0 + bump
            })
            .collect_vec();
        let baseline = als_baseline(&values, 1e5, 0.001, 20).unwrap();
        // the bump must not pull the baseline up
        assert_abs_diff_eq!(baseline[100], 53.0, epsilon = 1.0);
        assert_abs_diff_eq!(baseline[10], 8.0, epsilon = 1.0);
    }
}
