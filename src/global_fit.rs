//! Fitting one linear baseline per scan so that all scans of a map agree.
//!
//! Every scan of a map crosses pixels that other scans also cross. With the
//! right baselines removed, all samples falling in a pixel should agree, and
//! the map should be as flat as the sky allows. The fitter minimises the sum of
//! the per-pixel variances plus the scatter of the pixel means over the
//! baseline parameters of all scans at once.

use std::{
    fmt::{Display, Formatter},
    ops::Range,
};

use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::{izip, Itertools};
use log::{debug, trace};
use thiserror::Error;

use crate::{
    error::{BadArrayShape, ReductionWarning},
    image::{accumulate_indexed, Image, PixelGrid},
    optimize::Bfgs,
    util::std_dev,
};

#[derive(Error, Debug)]
/// Errors that can occur when fitting global baselines.
pub enum GlobalFitError {
    #[error(transparent)]
    /// Error for bad array shape in provided argument
    BadArrayShape(#[from] BadArrayShape),
}

/// Samples of one scan across the map.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    /// scan identifier, e.g. the file it came from
    pub id: String,
    /// sample times \[s\]
    pub time: Vec<f64>,
    /// x coordinate of each sample, in grid units
    pub x: Vec<f64>,
    /// y coordinate of each sample, in grid units
    pub y: Vec<f64>,
    /// detector counts of each sample
    pub counts: Vec<f64>,
    /// per-sample weight, 1 if `None`
    pub weight: Option<Vec<f64>>,
}

impl ScanRecord {
    /// A scan with unit weights.
    pub fn new(
        id: impl Into<String>,
        time: Vec<f64>,
        x: Vec<f64>,
        y: Vec<f64>,
        counts: Vec<f64>,
    ) -> Self {
        Self {
            id: id.into(),
            time,
            x,
            y,
            counts,
            weight: None,
        }
    }

    /// Set the per-sample weights.
    pub fn with_weight(mut self, weight: Vec<f64>) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Whether the scan has no samples.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Time span from the first to the last sample, 0 for empty scans.
    pub fn duration(&self) -> f64 {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) if (last - first).is_finite() => last - first,
            _ => 0.0,
        }
    }

    /// A scan without samples or without a time span cannot carry a slope.
    pub fn is_degenerate(&self) -> bool {
        !(self.duration() > 0.0)
    }

    fn check(&self) -> Result<(), BadArrayShape> {
        let expected = self.time.len();
        let fields = [
            ("x", self.x.len()),
            ("y", self.y.len()),
            ("counts", self.counts.len()),
            ("weight", self.weight.as_ref().map_or(expected, Vec::len)),
        ];
        for (argument, len) in fields {
            if len != expected {
                return Err(BadArrayShape {
                    argument: format!("{}.{argument}", self.id),
                    function: "GlobalBaselineFitter::fit".into(),
                    expected: format!("({expected},)"),
                    received: format!("({len},)"),
                });
            }
        }
        Ok(())
    }
}

/// A circular part of the map left out of the fit, usually around a bright
/// source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExcludedRegion {
    /// centre x, in grid units
    pub x: f64,
    /// centre y, in grid units
    pub y: f64,
    /// radius, in grid units
    pub radius: f64,
}

impl ExcludedRegion {
    /// Whether `(x, y)` lies inside the region.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        (x - self.x).powi(2) + (y - self.y).powi(2) <= self.radius.powi(2)
    }
}

/// `(slope, intercept)` of every scan, stored flat.
///
/// Degenerate scans hold `(0, 0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineParameters {
    values: Vec<f64>,
}

impl BaselineParameters {
    /// All-zero parameters for `num_scans` scans.
    pub fn zeros(num_scans: usize) -> Self {
        Self {
            values: vec![0.0; 2 * num_scans],
        }
    }

    /// Wrap `[slope_0, intercept_0, slope_1, intercept_1, ..]`.
    ///
    /// # Errors
    ///
    /// Will return [`BadArrayShape`] if `values` has an odd length.
    pub fn from_vec(values: Vec<f64>) -> Result<Self, BadArrayShape> {
        if values.len() % 2 != 0 {
            return Err(BadArrayShape {
                argument: "values".into(),
                function: "BaselineParameters::from_vec".into(),
                expected: "(2 * num_scans,)".into(),
                received: format!("({},)", values.len()),
            });
        }
        Ok(Self { values })
    }

    fn range(scan: usize) -> Range<usize> {
        2 * scan..2 * scan + 2
    }

    /// Number of scans described.
    pub fn num_scans(&self) -> usize {
        self.values.len() / 2
    }

    /// Slope of `scan` \[counts/s\].
    pub fn slope(&self, scan: usize) -> f64 {
        self.values[Self::range(scan)][0]
    }

    /// Intercept of `scan` at its first sample \[counts\].
    pub fn intercept(&self, scan: usize) -> f64 {
        self.values[Self::range(scan)][1]
    }

    /// Set both parameters of `scan`.
    pub fn set(&mut self, scan: usize, slope: f64, intercept: f64) {
        self.values[Self::range(scan)].copy_from_slice(&[slope, intercept]);
    }

    /// The flat parameter vector.
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// Options for the global baseline fit.
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct GlobalFitConfig {
    /// upper bound on optimiser iterations
    #[builder(default = "500")]
    pub max_iterations: usize,
    /// converged once every gradient component of the normalised objective
    /// is below this
    #[builder(default = "1e-9")]
    pub gradient_tolerance: f64,
    /// relative step of the numerical gradient
    #[builder(default = "1e-6")]
    pub difference_step: f64,
    /// show a progress bar on stderr
    #[builder(default = "false")]
    pub draw_progress: bool,
}

impl Default for GlobalFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            gradient_tolerance: 1e-9,
            difference_step: 1e-6,
            draw_progress: false,
        }
    }
}

impl Display for GlobalFitConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "global baseline fit, at most {} iterations, gradient tolerance {:e}",
            self.max_iterations, self.gradient_tolerance
        )
    }
}

/// Result of a global baseline fit.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalFit {
    /// baseline-subtracted counts of every scan, in input order
    pub corrected: Vec<Vec<f64>>,
    /// fitted baselines, in counts and seconds
    pub params: BaselineParameters,
    /// whether the optimiser reached its tolerance
    pub converged: bool,
    /// optimiser iterations
    pub iterations: usize,
    /// normalised objective at the starting parameters
    pub objective_start: f64,
    /// normalised objective at the fitted parameters
    pub objective_end: f64,
    /// everything that went wrong without stopping the fit
    pub warnings: Vec<ReductionWarning>,
}

/// Sum of pixel variances plus `n_valid` times the variance of the pixel
/// means, over the pixels with exposure.
pub fn image_objective(image: &Image) -> f64 {
    let (sum_variance, means): (f64, Vec<f64>) = image
        .valid_pixels()
        .fold((0.0, vec![]), |(sum, mut means), (_, mean, variance)| {
            means.push(mean);
            (sum + variance, means)
        });
    if means.is_empty() {
        return 0.0;
    }
    sum_variance + means.len() as f64 * std_dev(&means).powi(2)
}

/// Samples of the usable scans, flattened and normalised once per fit.
struct FitData {
    scan_indices: Vec<usize>,
    ranges: Vec<Range<usize>>,
    pixels: Vec<Option<(usize, usize)>>,
    norm_time: Vec<f64>,
    norm_counts: Vec<f64>,
    weights: Vec<f64>,
    shape: (usize, usize),
    counts_min: f64,
    counts_range: f64,
    time_scale: f64,
}

impl FitData {
    fn new(
        scans: &[ScanRecord],
        usable: &[usize],
        grid: &PixelGrid,
        excluded_regions: &[ExcludedRegion],
    ) -> Self {
        let (counts_min, counts_max) = usable
            .iter()
            .flat_map(|&idx| scans[idx].counts.iter())
            .filter(|c| c.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &c| (lo.min(c), hi.max(c)));
        let counts_range = counts_max - counts_min;
        let counts_range = if counts_range > 0.0 && counts_range.is_finite() {
            counts_range
        } else {
            1.0
        };
        let counts_min = if counts_min.is_finite() { counts_min } else { 0.0 };
        let time_scale = usable
            .iter()
            .map(|&idx| scans[idx].duration())
            .fold(0.0, f64::max);

        let mut data = Self {
            scan_indices: usable.to_vec(),
            ranges: Vec::with_capacity(usable.len()),
            pixels: vec![],
            norm_time: vec![],
            norm_counts: vec![],
            weights: vec![],
            shape: grid.shape(),
            counts_min,
            counts_range,
            time_scale,
        };
        for &idx in usable {
            let scan = &scans[idx];
            let start = data.pixels.len();
            let t0 = scan.time[0];
            for (sample, (&t, &x, &y, &c)) in
                izip!(&scan.time, &scan.x, &scan.y, &scan.counts).enumerate()
            {
                // pixels whose centre is in an excluded region are never valid
                let pixel = grid.locate(x, y).filter(|&pixel| {
                    let (cx, cy) = grid.pixel_centre(pixel);
                    !excluded_regions.iter().any(|region| region.contains(cx, cy))
                });
                data.pixels.push(pixel);
                data.norm_time.push((t - t0) / time_scale);
                data.norm_counts.push((c - counts_min) / counts_range);
                data.weights
                    .push(scan.weight.as_ref().map_or(1.0, |weight| weight[sample]));
            }
            data.ranges.push(start..data.pixels.len());
        }
        data
    }

    fn num_params(&self) -> usize {
        2 * self.ranges.len()
    }

    /// Normalised objective for the compact parameter vector of the usable
    /// scans. `scratch` holds one value per sample.
    fn objective(&self, params: &[f64], scratch: &mut [f64]) -> f64 {
        for (range, p) in self.ranges.iter().zip(params.chunks_exact(2)) {
            let (slope, intercept) = (p[0], p[1]);
            for sample in range.clone() {
                scratch[sample] =
                    self.norm_counts[sample] - (slope * self.norm_time[sample] + intercept);
            }
        }
        let image = accumulate_indexed(&self.pixels, scratch, Some(&self.weights), self.shape);
        image_objective(&image)
    }
}

/// Fits linear baselines to all scans of a map simultaneously.
#[derive(Debug, Clone, Default)]
pub struct GlobalBaselineFitter {
    config: GlobalFitConfig,
}

impl GlobalBaselineFitter {
    /// Create a fitter with the given options.
    pub fn new(config: GlobalFitConfig) -> Self {
        Self { config }
    }

    /// The options in use.
    pub fn config(&self) -> &GlobalFitConfig {
        &self.config
    }

    /// Fit one `(slope, intercept)` per scan.
    ///
    /// `initial_params` are in counts and seconds, as returned in
    /// [`GlobalFit::params`]; by default every scan starts flat at its first
    /// sample. Scans without a time span keep `(0, 0)` and are returned
    /// uncorrected. Samples falling in pixels whose centre lies inside an
    /// excluded region do not contribute to the objective, but are still
    /// corrected.
    ///
    /// Failing to converge is not an error: `converged` is `false` and the
    /// best parameters found are returned.
    ///
    /// # Errors
    ///
    /// Will return [`GlobalFitError::BadArrayShape`] if the fields of a scan
    /// have different lengths, or if `initial_params` does not describe
    /// every scan.
    pub fn fit(
        &self,
        scans: &[ScanRecord],
        grid: &PixelGrid,
        excluded_regions: &[ExcludedRegion],
        initial_params: Option<&BaselineParameters>,
    ) -> Result<GlobalFit, GlobalFitError> {
        trace!("start global fit");
        for scan in scans {
            scan.check()?;
        }
        if let Some(initial) = initial_params {
            if initial.num_scans() != scans.len() {
                return Err(BadArrayShape {
                    argument: "initial_params".into(),
                    function: "GlobalBaselineFitter::fit".into(),
                    expected: format!("({},)", 2 * scans.len()),
                    received: format!("({},)", initial.as_slice().len()),
                }
                .into());
            }
        }

        let mut warnings = vec![];
        let (usable, degenerate): (Vec<usize>, Vec<usize>) =
            (0..scans.len()).partition(|&idx| !scans[idx].is_degenerate());
        for &idx in &degenerate {
            warnings.push(
                ReductionWarning::degenerate(
                    "global fit",
                    format!(
                        "scan {} has {} samples spanning {} s, left uncorrected",
                        scans[idx].id,
                        scans[idx].len(),
                        scans[idx].duration()
                    ),
                )
                .emit(),
            );
        }

        let data = FitData::new(scans, &usable, grid, excluded_regions);
        debug!(
            "global fit: {} usable scans, {} samples, counts {} + {} x [0, 1], time scale {} s",
            usable.len(),
            data.pixels.len(),
            data.counts_min,
            data.counts_range,
            data.time_scale
        );

        let x0 = usable
            .iter()
            .zip(&data.ranges)
            .flat_map(|(&idx, range)| match initial_params {
                Some(initial) => [
                    initial.slope(idx) * data.time_scale / data.counts_range,
                    (initial.intercept(idx) - data.counts_min) / data.counts_range,
                ],
                None => [0.0, data.norm_counts[range.start]],
            })
            .collect_vec();

        let draw_target = if self.config.draw_progress {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let fit_progress =
            ProgressBar::with_draw_target(Some(self.config.max_iterations as u64), draw_target);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})",
        ) {
            fit_progress.set_style(style.progress_chars("=> "));
        }
        fit_progress.set_message("global fit");

        let bfgs = Bfgs {
            max_iterations: self.config.max_iterations,
            gradient_tolerance: self.config.gradient_tolerance,
            difference_step: self.config.difference_step,
        };
        let mut scratch = vec![0.0; data.pixels.len()];
        let result = if data.num_params() == 0 {
            None
        } else {
            Some(bfgs.minimize(
                |params| data.objective(params, &mut scratch),
                &x0,
                |_, _| fit_progress.inc(1),
            ))
        };
        fit_progress.finish();

        let mut params = BaselineParameters::zeros(scans.len());
        let mut corrected = scans.iter().map(|scan| scan.counts.clone()).collect_vec();
        let (converged, iterations, objective_start, objective_end) = match &result {
            Some(result) => {
                for (&idx, p) in data.scan_indices.iter().zip(result.x.chunks_exact(2)) {
                    let slope = p[0] * data.counts_range / data.time_scale;
                    let intercept = p[1] * data.counts_range + data.counts_min;
                    params.set(idx, slope, intercept);
                    let scan = &scans[idx];
                    let t0 = scan.time[0];
                    for (value, &t, &c) in izip!(&mut corrected[idx], &scan.time, &scan.counts) {
                        *value = c - (slope * (t - t0) + intercept);
                    }
                }
                (result.converged, result.iterations, result.fun_start, result.fun)
            }
            None => (true, 0, 0.0, 0.0),
        };
        if !converged {
            warnings.push(
                ReductionWarning::unreliable(
                    "global fit",
                    format!("no convergence after {iterations} iterations, using the best parameters found"),
                )
                .emit(),
            );
        }
        debug!(
            "global fit: objective {objective_start:e} -> {objective_end:e} in {iterations} iterations"
        );
        trace!("end global fit");

        Ok(GlobalFit {
            corrected,
            params,
            converged,
            iterations,
            objective_start,
            objective_end,
            warnings,
        })
    }
}
