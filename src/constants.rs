// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.
//!
//! All constants *must* be double precision.

/// Scale factor turning a median absolute deviation into a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.482_602_218_505_602;

/// Default rejection threshold of the spectral variability test, in units of
/// the reference MAD.
pub const DEFAULT_NOISE_THRESHOLD_SIGMA: f64 = 5.0;

/// Default width of the variability median filter, as a fraction of the
/// number of bins in the fitted band.
pub const DEFAULT_SMOOTHING_FRACTION: f64 = 0.05;

/// The variability median filter is never narrower than this many bins.
pub const MIN_SMOOTHING_WINDOW: usize = 11;

/// The sliding windows of the reference MAD are never shorter than this.
pub const MIN_MAD_WINDOW: usize = 20;

/// Light curves with at most this many samples are detrended with a median
/// instead of a penalised baseline.
pub const MIN_DETREND_SAMPLES: usize = 10;

/// A bad-bin run leaving fewer than this many good bins makes the
/// variability baseline suspect.
pub const MIN_GOOD_BINS: usize = 5;

/// Number of equal sub-bands used to band-average a calibrator spectrum.
pub const FLUX_INTEGRATION_SUBBANDS: usize = 20;

/// Fractional uncertainty assumed for spectral-model coefficients without an
/// explicit error.
pub const DEFAULT_COEFF_REL_ERR: f64 = 0.05;

/// Rejection threshold of the clipped constant fit, in sigmas.
pub const DEFAULT_CLIP_SIGMA: f64 = 5.0;

/// Fewer usable points than this and the elevation fit falls back to a
/// constant; the clipped fit also stops here.
pub const MIN_CALIBRATION_POINTS: usize = 5;

/// Huber tuning constant (95% efficiency for Gaussian residuals).
pub const HUBER_T: f64 = 1.345;

/// Default tolerance of the calibrator self-consistency check.
pub const DEFAULT_CONSISTENCY_EPSILON: f64 = 0.05;

/// Perley & Butler (2010) polynomial coefficients of
/// `log10(S/Jy) = Σ a_i log10(ν/GHz)^i` for the default calibrators, with
/// their common aliases.
pub const PERLEY_BUTLER_2010: &[(&str, &[&str], [f64; 4])] = &[
    ("3C48", &["J0137+3309", "0134+329"], [1.3253, -0.7553, -0.1914, 0.0498]),
    ("3C138", &["J0521+1638", "0518+165"], [1.0088, -0.4981, -0.1550, -0.0100]),
    ("3C147", &["J0542+4951", "0538+498"], [1.4516, -0.6961, -0.2007, 0.0640]),
    ("3C286", &["J1331+3030", "1328+307"], [1.2515, -0.4605, -0.1715, 0.0336]),
];
