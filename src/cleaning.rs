//! Cleaning dynamical spectra from RFI using their spectral variability.
//!
//! Radio-frequency interference tends to switch on and off, so a contaminated
//! frequency bin varies much more in time than its neighbours. For every bin
//! we compute the normalised rms variability, fit a smooth baseline to it, and
//! flag the bins that stray too far from that baseline. Flagged bins are then
//! interpolated over, and the light curve is rebuilt from the retained bins.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    ops::Range,
};

use derive_builder::Builder;
use itertools::{izip, Itertools};
use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

use crate::{
    constants::{
        DEFAULT_NOISE_THRESHOLD_SIGMA, DEFAULT_SMOOTHING_FRACTION, MIN_DETREND_SAMPLES,
        MIN_GOOD_BINS, MIN_MAD_WINDOW, MIN_SMOOTHING_WINDOW,
    },
    error::{BadArrayShape, ReductionWarning},
    util::{als_baseline, contiguous_regions, median, median_filter, odd_at_least, ref_mad},
};

#[derive(Error, Debug)]
/// Errors that can occur when cleaning a dynamical spectrum.
pub enum CleanError {
    #[error(transparent)]
    /// Error for bad array shape in provided argument
    BadArrayShape(#[from] BadArrayShape),

    #[error("invalid frequency band selection {band}: {reason}")]
    /// The requested band does not select any bin
    InvalidBand {
        /// The requested band
        band: BandSelection,
        /// What is wrong with it
        reason: String,
    },

    #[error("bandwidth must be positive and finite, received {bandwidth_mhz} MHz")]
    /// The bandwidth cannot be used to convert bins to frequencies
    InvalidBandwidth {
        /// The bandwidth that was received
        bandwidth_mhz: f64,
    },

    #[error("feed {feed} has cross-polarisation channels but no total-power channel to take a mask from")]
    /// A cross-polarisation channel would have to compute its own mask
    MissingTotalPower {
        /// The feed index
        feed: usize,
    },
}

/// Which part of the band is eligible for the light curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BandSelection {
    /// The whole band.
    All,
    /// A fraction of the band, e.g. `(0.1, 0.9)` drops 10% on both sides.
    Fraction {
        /// lower edge, as a fraction of the bandwidth
        min: f64,
        /// upper edge, as a fraction of the bandwidth
        max: f64,
    },
    /// An explicit range, in MHz from the start of the band.
    Mhz {
        /// lower edge \[MHz\]
        min: f64,
        /// upper edge \[MHz\]
        max: f64,
    },
}

impl Default for BandSelection {
    fn default() -> Self {
        Self::Fraction { min: 0.1, max: 0.9 }
    }
}

impl Display for BandSelection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Fraction { min, max } => write!(f, "{min}-{max} of the band"),
            Self::Mhz { min, max } => write!(f, "{min}:{max} MHz"),
        }
    }
}

impl BandSelection {
    /// The bin range `[binmin, binmax)` selected out of `num_bins` bins
    /// spanning `bandwidth_mhz`.
    ///
    /// # Errors
    ///
    /// Will return [`CleanError::InvalidBand`] if the selection is inverted,
    /// out of bounds or empty.
    pub fn bin_range(&self, num_bins: usize, bandwidth_mhz: f64) -> Result<Range<usize>, CleanError> {
        let invalid = |reason: &str| CleanError::InvalidBand {
            band: *self,
            reason: reason.into(),
        };
        // tolerate representation error in e.g. 100 * 0.9
        let to_bin = |value: f64| ((value + 1e-9).floor().max(0.0) as usize).min(num_bins);
        let range = match *self {
            Self::All => 0..num_bins,
            Self::Fraction { min, max } => {
                if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min >= max {
                    return Err(invalid("fractions must satisfy 0 <= min < max <= 1"));
                }
                to_bin(num_bins as f64 * min)..to_bin(num_bins as f64 * max)
            }
            Self::Mhz { min, max } => {
                if !(min < max) {
                    return Err(invalid("min must be below max"));
                }
                let df = bandwidth_mhz / num_bins as f64;
                to_bin(min / df)..to_bin(max / df)
            }
        };
        if range.is_empty() {
            return Err(invalid("no frequency bin selected"));
        }
        Ok(range)
    }
}

/// Options for cleaning dynamical spectra.
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct CleanConfig {
    /// Bins whose variability is further than this many reference MADs from
    /// the baseline are flagged.
    #[builder(default = "DEFAULT_NOISE_THRESHOLD_SIGMA")]
    pub noise_threshold_sigma: f64,
    /// Width of the variability median filter, as a fraction of the bins in
    /// the band.
    #[builder(default = "DEFAULT_SMOOTHING_FRACTION")]
    pub smoothing_fraction: f64,
    /// Skip the variability test, only applying the band and keep masks.
    #[builder(default = "false")]
    pub disable_filtering: bool,
    /// The part of the band used for the light curve.
    #[builder(default)]
    pub band: BandSelection,
    /// Shortest sliding window used for the reference MAD.
    #[builder(default = "MIN_MAD_WINDOW")]
    pub min_mad_window: usize,
    /// Light curves with at most this many samples are median subtracted
    /// instead of being fit with a baseline.
    #[builder(default = "MIN_DETREND_SAMPLES")]
    pub min_detrend_samples: usize,
    /// Smoothness penalty of the light curve baseline.
    #[builder(default = "1e5")]
    pub als_lambda: f64,
    /// Weight of points above the light curve baseline.
    #[builder(default = "0.001")]
    pub als_asymmetry: f64,
    /// Maximum re-weighting iterations of the light curve baseline.
    #[builder(default = "20")]
    pub als_iterations: usize,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            noise_threshold_sigma: DEFAULT_NOISE_THRESHOLD_SIGMA,
            smoothing_fraction: DEFAULT_SMOOTHING_FRACTION,
            disable_filtering: false,
            band: BandSelection::default(),
            min_mad_window: MIN_MAD_WINDOW,
            min_detrend_samples: MIN_DETREND_SAMPLES,
            als_lambda: 1e5,
            als_asymmetry: 0.001,
            als_iterations: 20,
        }
    }
}

impl Display for CleanConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.disable_filtering {
            write!(f, "no variability filtering, band {}", self.band)
        } else {
            write!(
                f,
                "variability filtering at {} sigma (smoothing {}), band {}",
                self.noise_threshold_sigma, self.smoothing_fraction, self.band
            )
        }
    }
}

/// Intermediate products of the variability test, useful for diagnostic
/// plots.
#[derive(Debug, Clone, PartialEq)]
pub struct VariabilityDiagnostics {
    /// normalised rms variability of each bin
    pub variability: Vec<f64>,
    /// smoothed variability baseline
    pub baseline: Vec<f64>,
    /// lower acceptance threshold of each bin
    pub threshold_low: Vec<f64>,
    /// upper acceptance threshold of each bin
    pub threshold_high: Vec<f64>,
    /// robust scale of the variability scatter
    pub scale: f64,
}

impl VariabilityDiagnostics {
    /// Whether each bin passes the variability test. Bins with an undefined
    /// variability (zero mean) never pass.
    pub fn accepted(&self) -> Vec<bool> {
        izip!(&self.variability, &self.threshold_low, &self.threshold_high)
            .map(|(v, low, high)| v >= low && v <= high)
            .collect()
    }
}

/// The result of cleaning one channel of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedSpectrum {
    /// time of each sample since the start of the scan \[s\]
    pub times: Vec<f64>,
    /// detrended light curve of the retained bins
    pub light_curve: Vec<f64>,
    /// light curve of the retained bins before detrending
    pub raw_light_curve: Vec<f64>,
    /// detrended light curve of all bins, before any cleaning
    pub initial_light_curve: Vec<f64>,
    /// `true` for retained bins
    pub mask: Vec<bool>,
    /// lower edge of the fitted band \[MHz\]
    pub band_min_mhz: f64,
    /// upper edge of the fitted band \[MHz\]
    pub band_max_mhz: f64,
    /// the dynamical spectrum with bad bins interpolated over
    pub cleaned_spectrum: Array2<f64>,
    /// `None` when no variability test was run
    pub diagnostics: Option<VariabilityDiagnostics>,
    /// everything that went wrong without stopping the cleaning
    pub warnings: Vec<ReductionWarning>,
}

/// Polarisation of a receiver channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarization {
    /// left circular, total power
    Lcp,
    /// right circular, total power
    Rcp,
    /// Stokes Q-like cross product
    Q,
    /// Stokes U-like cross product
    U,
}

impl Polarization {
    /// Whether this channel measures total power (and so computes its own
    /// mask).
    pub fn is_total_power(self) -> bool {
        matches!(self, Self::Lcp | Self::Rcp)
    }
}

/// One channel of a scan, as handed over by the ingestion code.
#[derive(Debug, Clone)]
pub struct ChannelSpectrum<'a> {
    /// channel name, e.g. "Feed0_LCP"
    pub name: String,
    /// feed the channel belongs to
    pub feed: usize,
    /// polarisation of the channel
    pub polarization: Polarization,
    /// dynamical spectrum, `[time][frequency]`
    pub spectrum: ArrayView2<'a, f64>,
}

/// Flags RFI-contaminated bins of dynamical spectra and produces cleaned
/// light curves.
#[derive(Debug, Clone, Default)]
pub struct SpectralCleaner {
    config: CleanConfig,
}

impl SpectralCleaner {
    /// Create a cleaner with the given options.
    pub fn new(config: CleanConfig) -> Self {
        Self { config }
    }

    /// The options in use.
    pub fn config(&self) -> &CleanConfig {
        &self.config
    }

    /// Clean the dynamical spectrum of a single channel.
    ///
    /// `spectrum` has dimensions `[time][frequency]` and covers
    /// `duration_s` seconds and `bandwidth_mhz` MHz. Bins set in `keep_mask`
    /// (e.g. known spectral lines) are always retained.
    ///
    /// A spectrum with a single frequency bin is returned unchanged.
    ///
    /// # Errors
    ///
    /// Will return [`CleanError::BadArrayShape`] for an empty spectrum or a
    /// `keep_mask` of the wrong length, [`CleanError::InvalidBandwidth`] for a
    /// non-positive bandwidth and [`CleanError::InvalidBand`] if the band
    /// selection is unusable. Noisy or degenerate data never produce an
    /// error, only warnings.
    pub fn clean(
        &self,
        spectrum: ArrayView2<f64>,
        duration_s: f64,
        bandwidth_mhz: f64,
        keep_mask: Option<&[bool]>,
    ) -> Result<CleanedSpectrum, CleanError> {
        trace!("start clean");
        let (num_times, num_bins) = check_spectrum(spectrum, "clean")?;
        if !(bandwidth_mhz > 0.0) || !bandwidth_mhz.is_finite() {
            return Err(CleanError::InvalidBandwidth { bandwidth_mhz });
        }
        if let Some(keep_mask) = keep_mask {
            if keep_mask.len() != num_bins {
                return Err(BadArrayShape {
                    argument: "keep_mask".into(),
                    function: "clean".into(),
                    expected: format!("({num_bins},)"),
                    received: format!("({},)", keep_mask.len()),
                }
                .into());
            }
        }
        let times = sample_times(num_times, duration_s);

        if num_bins == 1 {
            let light_curve = spectrum.column(0).to_vec();
            return Ok(CleanedSpectrum {
                times,
                light_curve: light_curve.clone(),
                raw_light_curve: light_curve.clone(),
                initial_light_curve: light_curve,
                mask: vec![true],
                band_min_mhz: 0.0,
                band_max_mhz: bandwidth_mhz,
                cleaned_spectrum: spectrum.to_owned(),
                diagnostics: None,
                warnings: vec![],
            });
        }

        let mut warnings = vec![];
        let initial_sum = spectrum.sum_axis(Axis(1)).to_vec();
        let initial_light_curve = self.detrend(&initial_sum, &mut warnings);

        let variability = spectral_variability(spectrum);
        let band = self.config.band.bin_range(num_bins, bandwidth_mhz)?;
        let df = bandwidth_mhz / num_bins as f64;

        let (diagnostics, good) = if self.config.disable_filtering {
            (
                self.variability_thresholds(&variability, band.clone()),
                vec![true; num_bins],
            )
        } else {
            let diagnostics = self.refined_thresholds(&variability, band.clone());
            let good = diagnostics.accepted();
            (diagnostics, good)
        };

        // the keep mask overrides the variability test, never the band
        let mask = (0..num_bins)
            .map(|bin| {
                let forced = keep_mask.map_or(false, |keep| keep[bin]);
                band.contains(&bin) && (forced || good[bin])
            })
            .collect_vec();
        debug!(
            "clean: band bins {:?}, {} of {} bins retained, scale {:e}",
            band,
            mask.iter().filter(|&&m| m).count(),
            num_bins,
            diagnostics.scale
        );

        let mut cleaned = self.apply_mask(spectrum, &mask, times, &mut warnings);
        cleaned.initial_light_curve = initial_light_curve;
        cleaned.band_min_mhz = band.start as f64 * df;
        cleaned.band_max_mhz = band.end as f64 * df;
        cleaned.diagnostics = Some(diagnostics);
        cleaned.warnings = warnings;
        trace!("end clean");
        Ok(cleaned)
    }

    /// Interpolate a dynamical spectrum over the bins that are `false` in
    /// `mask` and build its light curve, without any variability test.
    ///
    /// This is how cross-polarisation channels are cleaned: they must use the
    /// mask of their total-power channels.
    ///
    /// # Errors
    ///
    /// Will return [`CleanError::BadArrayShape`] for an empty spectrum or a
    /// mask of the wrong length, and [`CleanError::InvalidBand`] if the band
    /// selection is unusable.
    pub fn with_mask(
        &self,
        spectrum: ArrayView2<f64>,
        duration_s: f64,
        bandwidth_mhz: f64,
        mask: &[bool],
    ) -> Result<CleanedSpectrum, CleanError> {
        let (num_times, num_bins) = check_spectrum(spectrum, "with_mask")?;
        if mask.len() != num_bins {
            return Err(BadArrayShape {
                argument: "mask".into(),
                function: "with_mask".into(),
                expected: format!("({num_bins},)"),
                received: format!("({},)", mask.len()),
            }
            .into());
        }
        let mut warnings = vec![];
        let initial_sum = spectrum.sum_axis(Axis(1)).to_vec();
        let initial_light_curve = self.detrend(&initial_sum, &mut warnings);
        let times = sample_times(num_times, duration_s);
        let mut cleaned = self.apply_mask(spectrum, mask, times, &mut warnings);
        cleaned.initial_light_curve = initial_light_curve;
        if num_bins > 1 && bandwidth_mhz > 0.0 {
            let band = self.config.band.bin_range(num_bins, bandwidth_mhz)?;
            let df = bandwidth_mhz / num_bins as f64;
            cleaned.band_min_mhz = band.start as f64 * df;
            cleaned.band_max_mhz = band.end as f64 * df;
        } else {
            cleaned.band_max_mhz = bandwidth_mhz;
        }
        cleaned.warnings = warnings;
        Ok(cleaned)
    }

    /// Clean all channels of a scan.
    ///
    /// Total-power channels are cleaned independently. Their masks are
    /// combined per feed (a bin survives only if every total-power channel
    /// retains it), and the combined mask is applied to the
    /// cross-polarisation channels of the same feed. Results are returned in
    /// the order of `channels`.
    ///
    /// # Errors
    ///
    /// Will return [`CleanError::MissingTotalPower`] if a feed only has
    /// cross-polarisation channels, plus any error of [`SpectralCleaner::clean`].
    pub fn clean_feed(
        &self,
        channels: &[ChannelSpectrum],
        duration_s: f64,
        bandwidth_mhz: f64,
        keep_mask: Option<&[bool]>,
    ) -> Result<Vec<(String, CleanedSpectrum)>, CleanError> {
        let mut results: Vec<Option<CleanedSpectrum>> = vec![None; channels.len()];
        let mut feed_masks: BTreeMap<usize, Vec<bool>> = BTreeMap::new();

        for (idx, channel) in channels.iter().enumerate() {
            if !channel.polarization.is_total_power() {
                continue;
            }
            let cleaned = self.clean(channel.spectrum, duration_s, bandwidth_mhz, keep_mask)?;
            match feed_masks.get_mut(&channel.feed) {
                Some(combined) if combined.len() != cleaned.mask.len() => {
                    return Err(BadArrayShape {
                        argument: "channels".into(),
                        function: "clean_feed".into(),
                        expected: format!("({},) bins for feed {}", combined.len(), channel.feed),
                        received: format!("({},)", cleaned.mask.len()),
                    }
                    .into());
                }
                Some(combined) => combined
                    .iter_mut()
                    .zip(&cleaned.mask)
                    .for_each(|(c, &m)| *c &= m),
                None => {
                    feed_masks.insert(channel.feed, cleaned.mask.clone());
                }
            }
            results[idx] = Some(cleaned);
        }

        for (idx, channel) in channels.iter().enumerate() {
            if channel.polarization.is_total_power() {
                continue;
            }
            let mask = feed_masks
                .get(&channel.feed)
                .ok_or(CleanError::MissingTotalPower { feed: channel.feed })?;
            results[idx] = Some(self.with_mask(channel.spectrum, duration_s, bandwidth_mhz, mask)?);
        }

        Ok(channels
            .iter()
            .zip(results)
            .filter_map(|(channel, result)| result.map(|r| (channel.name.clone(), r)))
            .collect())
    }

    /// Subtract a slowly varying baseline from a light curve.
    ///
    /// Long light curves get an asymmetric least squares baseline followed by
    /// a median offset correction; short ones only have their median removed.
    pub fn detrend(&self, light_curve: &[f64], warnings: &mut Vec<ReductionWarning>) -> Vec<f64> {
        let subtract_median = |values: &[f64]| {
            let centre = median(values);
            let centre = if centre.is_finite() { centre } else { 0.0 };
            values.iter().map(|v| v - centre).collect_vec()
        };

        if light_curve.len() <= self.config.min_detrend_samples {
            warnings.push(
                ReductionWarning::degenerate(
                    "detrend",
                    format!(
                        "only {} samples, subtracting the median instead of fitting a baseline",
                        light_curve.len()
                    ),
                )
                .emit(),
            );
            return subtract_median(light_curve);
        }

        match als_baseline(
            light_curve,
            self.config.als_lambda,
            self.config.als_asymmetry,
            self.config.als_iterations,
        ) {
            Some(baseline) => {
                let residual = light_curve
                    .iter()
                    .zip(&baseline)
                    .map(|(y, z)| y - z)
                    .collect_vec();
                subtract_median(&residual)
            }
            None => {
                warnings.push(
                    ReductionWarning::unreliable(
                        "detrend",
                        "baseline system could not be solved, subtracting the median",
                    )
                    .emit(),
                );
                subtract_median(light_curve)
            }
        }
    }

    /// Baseline and acceptance thresholds of the variability curve.
    fn variability_thresholds(&self, variability: &[f64], band: Range<usize>) -> VariabilityDiagnostics {
        let num_bins = variability.len();
        let band_len = band.len();
        let window = MIN_SMOOTHING_WINDOW.max(odd_at_least(
            (band_len as f64 * self.config.smoothing_fraction) as usize,
        ));

        let filtered = median_filter(&variability[band.clone()], window);
        let first = filtered[0];
        let last = filtered[band_len - 1];
        let baseline = (0..num_bins)
            .map(|bin| {
                if bin < band.start {
                    first
                } else if bin >= band.end {
                    last
                } else {
                    filtered[bin - band.start]
                }
            })
            .collect_vec();

        let residual = band
            .clone()
            .map(|bin| {
                // an interpolated run repeats one column, count it once
                if bin > band.start && variability[bin] == variability[bin - 1] {
                    f64::NAN
                } else {
                    variability[bin] - baseline[bin]
                }
            })
            .collect_vec();
        let scale = ref_mad(&residual, self.config.min_mad_window.max(window));
        let scale = if scale.is_finite() { scale } else { 0.0 };
        let half_width = self.config.noise_threshold_sigma * scale;

        VariabilityDiagnostics {
            variability: variability.to_vec(),
            threshold_low: baseline.iter().map(|b| b - half_width).collect(),
            threshold_high: baseline.iter().map(|b| b + half_width).collect(),
            baseline,
            scale,
        }
    }

    /// Thresholds fitted a second time without the bins the first pass
    /// rejected, so a run of bad bins cannot pull the baseline towards them.
    /// Where the second pass has nothing left to work with, the first
    /// estimate stands.
    fn refined_thresholds(&self, variability: &[f64], band: Range<usize>) -> VariabilityDiagnostics {
        let first = self.variability_thresholds(variability, band.clone());
        let accepted = first.accepted();
        if accepted[band.clone()].iter().all(|&ok| ok) {
            return first;
        }
        let masked = variability
            .iter()
            .zip(&accepted)
            .map(|(&v, &ok)| if ok { v } else { f64::NAN })
            .collect_vec();
        let second = self.variability_thresholds(&masked, band);

        let scale = if second.scale > 0.0 {
            second.scale
        } else {
            first.scale
        };
        let half_width = self.config.noise_threshold_sigma * scale;
        let baseline = second
            .baseline
            .iter()
            .zip(&first.baseline)
            .map(|(&b2, &b1)| if b2.is_finite() { b2 } else { b1 })
            .collect_vec();
        trace!(
            "variability scale {:e} -> {:e} without {} rejected bins",
            first.scale,
            scale,
            accepted.iter().filter(|&&ok| !ok).count()
        );
        VariabilityDiagnostics {
            variability: variability.to_vec(),
            threshold_low: baseline.iter().map(|b| b - half_width).collect(),
            threshold_high: baseline.iter().map(|b| b + half_width).collect(),
            baseline,
            scale,
        }
    }

    /// Interpolate over the masked bins and build the light curves.
    fn apply_mask(
        &self,
        spectrum: ArrayView2<f64>,
        mask: &[bool],
        times: Vec<f64>,
        warnings: &mut Vec<ReductionWarning>,
    ) -> CleanedSpectrum {
        let num_bins = mask.len();
        let bad = mask.iter().map(|&m| !m).collect_vec();
        let bad_runs = contiguous_regions(&bad);

        if let Some(longest) = bad_runs.iter().map(|run| run.len()).max() {
            if longest + MIN_GOOD_BINS > num_bins && num_bins > MIN_GOOD_BINS {
                warnings.push(
                    ReductionWarning::unreliable(
                        "clean",
                        format!(
                            "a bad interval covers {longest} of {num_bins} bins, the variability baseline may be unreliable"
                        ),
                    )
                    .emit(),
                );
            }
        }

        let cleaned_spectrum = interpolate_bad_runs(spectrum, &bad_runs);

        let retained = mask.iter().filter(|&&m| m).count();
        let raw_light_curve = if retained == 0 {
            warnings.push(
                ReductionWarning::unreliable("clean", "no frequency bin retained, light curve is empty")
                    .emit(),
            );
            vec![0.0; spectrum.nrows()]
        } else {
            cleaned_spectrum
                .outer_iter()
                .map(|row| {
                    row.iter()
                        .zip(mask)
                        .filter(|(_, &m)| m)
                        .map(|(v, _)| v)
                        .sum::<f64>()
                })
                .collect_vec()
        };
        let light_curve = self.detrend(&raw_light_curve, warnings);

        CleanedSpectrum {
            times,
            light_curve,
            raw_light_curve,
            initial_light_curve: vec![],
            mask: mask.to_vec(),
            band_min_mhz: 0.0,
            band_max_mhz: 0.0,
            cleaned_spectrum,
            diagnostics: None,
            warnings: vec![],
        }
    }
}

fn check_spectrum(spectrum: ArrayView2<f64>, function: &str) -> Result<(usize, usize), CleanError> {
    let (num_times, num_bins) = spectrum.dim();
    if num_times == 0 || num_bins == 0 {
        return Err(BadArrayShape {
            argument: "spectrum".into(),
            function: function.into(),
            expected: "(>0, >0)".into(),
            received: format!("{:?}", spectrum.dim()),
        }
        .into());
    }
    Ok((num_times, num_bins))
}

fn sample_times(num_times: usize, duration_s: f64) -> Vec<f64> {
    (0..num_times)
        .map(|t| duration_s * t as f64 / num_times as f64)
        .collect()
}

/// Normalised rms variability of each frequency bin of a dynamical spectrum,
/// `sqrt(mean_t((S - <S>)^2)) / <S>`.
///
/// Bins with zero mean give a non-finite value.
pub fn spectral_variability(spectrum: ArrayView2<f64>) -> Vec<f64> {
    let num_times = spectrum.nrows() as f64;
    spectrum
        .axis_iter(Axis(1))
        .map(|column| {
            let mean = column.sum() / num_times;
            let rms = (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / num_times).sqrt();
            rms / mean
        })
        .collect()
}

/// Replace the columns of each bad run: runs touching an edge copy the
/// adjacent good column, interior runs take the mean of the good columns on
/// either side (see [`matched_average`]). A run covering the whole band is
/// left alone.
fn interpolate_bad_runs(spectrum: ArrayView2<f64>, bad_runs: &[Range<usize>]) -> Array2<f64> {
    let num_bins = spectrum.ncols();
    let mut cleaned = spectrum.to_owned();
    for run in bad_runs {
        let fill = match (run.start, run.end) {
            (0, end) if end == num_bins => continue,
            (0, end) => spectrum.column(end).to_owned(),
            (start, end) if end == num_bins => spectrum.column(start - 1).to_owned(),
            (start, end) => matched_average(spectrum.column(start - 1), spectrum.column(end)),
        };
        for bin in run.clone() {
            cleaned.column_mut(bin).assign(&fill);
        }
    }
    cleaned
}

/// Average of two columns whose fluctuations around their time mean are
/// rescaled to the mean rms of the two.
///
/// Averaging independent noise lowers its rms by √2, which would make the
/// filled bins stand out as too quiet the next time the spectrum is cleaned.
/// Columns dominated by a common signal are left as plain averages.
fn matched_average(left: ArrayView1<f64>, right: ArrayView1<f64>) -> Array1<f64> {
    let average = (&left + &right) / 2.0;
    let target = (left.std(0.0) + right.std(0.0)) / 2.0;
    let own = average.std(0.0);
    if !(own > 0.0) || !target.is_finite() {
        return average;
    }
    let centre = average.mean().unwrap_or(0.0);
    average.mapv(|v| centre + (v - centre) * target / own)
}
