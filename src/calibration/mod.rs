//! Flux calibration: turning detector counts into Jansky.
//!
//! Calibrator scans give the ratio between the known flux density of a source
//! and the counts it produced. Those ratios are fit against elevation per
//! channel, and the resulting [`ConversionFunction`] is applied to every
//! other source.

use std::{
    collections::HashMap,
    f64::consts::PI,
    fmt::{Display, Formatter},
    str::FromStr,
};

use derive_builder::Builder;
use itertools::Itertools;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    constants::{
        DEFAULT_CLIP_SIGMA, DEFAULT_CONSISTENCY_EPSILON, HUBER_T, MIN_CALIBRATION_POINTS,
    },
    error::ReductionWarning,
};

pub mod fit;
pub mod registry;

pub use fit::{ConversionFit, ConversionFunction, IterativeClippedConstantFit, RobustLinearFit};
pub use registry::{Calibrator, CalibratorRegistry, FluxModel, TabulatedFlux};

#[derive(Error, Debug)]
/// Errors that can occur when calibrating counts into flux densities.
pub enum CalibrationError {
    #[error("unknown flux unit {unit:?}, expected one of Jy/beam, Jy/sr, Jy/pixel")]
    /// The requested flux unit is not supported
    UnknownFluxUnit {
        /// The unit that was requested
        unit: String,
    },

    #[error("a pixel solid angle must be configured to convert to Jy/pixel")]
    /// Jy/pixel was requested without a pixel size
    MissingPixelArea,

    #[error("no calibrator observation usable for channel {channel} (excluded source: {excluded:?})")]
    /// No calibrator row is available to build a conversion
    NoCalibrators {
        /// The channel name
        channel: String,
        /// The source left out of the fit, if any
        excluded: Option<String>,
    },
}

/// The unit calibrated maps are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FluxUnit {
    /// flux density per beam, from peak counts
    JyPerBeam,
    /// surface brightness, from the flux integral
    JyPerSr,
    /// surface brightness times the pixel solid angle
    JyPerPixel,
}

impl FromStr for FluxUnit {
    type Err = CalibrationError;

    fn from_str(unit: &str) -> Result<Self, Self::Err> {
        match unit.trim().to_lowercase().as_str() {
            "jy/beam" => Ok(Self::JyPerBeam),
            "jy/sr" => Ok(Self::JyPerSr),
            "jy/pixel" => Ok(Self::JyPerPixel),
            _ => Err(CalibrationError::UnknownFluxUnit { unit: unit.into() }),
        }
    }
}

impl Display for FluxUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::JyPerBeam => "Jy/beam",
                Self::JyPerSr => "Jy/sr",
                Self::JyPerPixel => "Jy/pixel",
            }
        )
    }
}

/// One row of the calibration table: a fitted source in one channel of one
/// scan.
///
/// `flux_jy` is zero for sources without a tabulated flux. The derived
/// columns are filled by [`fit_counts_to_flux`] and
/// [`CalibrationModel::compute_source_fluxes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibratorObservation {
    /// mid-scan time \[MJD\]
    pub time_mjd: f64,
    /// centre frequency \[MHz\]
    pub frequency_mhz: f64,
    /// bandwidth \[MHz\]
    pub bandwidth_mhz: f64,
    /// fitted peak amplitude \[counts\]
    pub counts: f64,
    /// uncertainty of `counts`
    pub counts_err: f64,
    /// fitted Gaussian width \[rad\]
    pub width_rad: f64,
    /// uncertainty of `width_rad`
    pub width_err_rad: f64,
    /// elevation of the source \[rad\]
    pub elevation_rad: f64,
    /// azimuth of the source \[rad\]
    pub azimuth_rad: f64,
    /// observed source name
    pub source: String,
    /// channel name
    pub channel: String,
    /// tabulated flux density \[Jy\], zero if unknown
    pub flux_jy: f64,
    /// uncertainty of `flux_jy`
    pub flux_err_jy: f64,
    /// `flux_jy / counts`, zero until computed
    pub flux_over_counts: f64,
    /// uncertainty of `flux_over_counts`
    pub flux_over_counts_err: f64,
    /// `flux_jy / (2π counts width²)` \[Jy/sr/count\]
    pub flux_integral_over_counts: f64,
    /// uncertainty of `flux_integral_over_counts`
    pub flux_integral_over_counts_err: f64,
    /// flux density derived from the conversion \[Jy\]
    pub computed_flux_jy: f64,
    /// uncertainty of `computed_flux_jy`
    pub computed_flux_err_jy: f64,
}

impl CalibratorObservation {
    /// Whether this row has a tabulated flux and can be used for calibration.
    pub fn is_calibrator(&self) -> bool {
        self.flux_jy > 0.0
    }

    fn ratio(&self, unit: FluxUnit) -> (f64, f64) {
        match unit {
            FluxUnit::JyPerBeam => (self.flux_over_counts, self.flux_over_counts_err),
            FluxUnit::JyPerSr | FluxUnit::JyPerPixel => (
                self.flux_integral_over_counts,
                self.flux_integral_over_counts_err,
            ),
        }
    }
}

/// Fill `flux_over_counts` and `flux_integral_over_counts`, with their
/// uncertainties, for every calibrator row of `table`.
///
/// Relative uncertainties are added linearly. Rows without a flux or with
/// zero counts are left untouched.
pub fn fit_counts_to_flux(table: &mut [CalibratorObservation]) {
    for row in table.iter_mut() {
        if !row.is_calibrator() || row.counts == 0.0 || !row.counts.is_finite() {
            continue;
        }
        let flux_rel = row.flux_err_jy / row.flux_jy;
        let counts_rel = (row.counts_err / row.counts).abs();

        row.flux_over_counts = row.flux_jy / row.counts;
        row.flux_over_counts_err = (flux_rel + counts_rel) * row.flux_over_counts.abs();

        if row.width_rad > 0.0 {
            let width_rel = row.width_err_rad / row.width_rad;
            row.flux_integral_over_counts =
                row.flux_jy / (2.0 * PI * row.counts * row.width_rad.powi(2));
            row.flux_integral_over_counts_err = (flux_rel + counts_rel + 2.0 * width_rel)
                * row.flux_integral_over_counts.abs();
        }
    }
}

/// Options for building conversion functions.
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// fit a robust line in elevation instead of a clipped constant
    #[builder(default = "true")]
    pub robust: bool,
    /// rejection threshold of the clipped constant fit, in sigmas
    #[builder(default = "DEFAULT_CLIP_SIGMA")]
    pub clip_sigma: f64,
    /// fewer calibrator points than this and fits fall back or warn
    #[builder(default = "MIN_CALIBRATION_POINTS")]
    pub min_points: usize,
    /// Huber tuning constant of the robust line
    #[builder(default = "HUBER_T")]
    pub huber_t: f64,
    /// upper bound on iterations of either fit
    #[builder(default = "100")]
    pub max_iterations: usize,
    /// solid angle of a map pixel \[sr\], needed for Jy/pixel
    #[builder(default)]
    pub pixel_area_sr: Option<f64>,
    /// relative tolerance of the self-consistency check
    #[builder(default = "DEFAULT_CONSISTENCY_EPSILON")]
    pub consistency_epsilon: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            robust: true,
            clip_sigma: DEFAULT_CLIP_SIGMA,
            min_points: MIN_CALIBRATION_POINTS,
            huber_t: HUBER_T,
            max_iterations: 100,
            pixel_area_sr: None,
            consistency_epsilon: DEFAULT_CONSISTENCY_EPSILON,
        }
    }
}

impl CalibrationConfig {
    /// The fit strategy these options select.
    pub fn fitter(&self) -> Box<dyn ConversionFit> {
        let clipped = IterativeClippedConstantFit {
            clip_sigma: self.clip_sigma,
            min_points: self.min_points,
            max_iterations: self.max_iterations,
        };
        if self.robust {
            Box::new(RobustLinearFit {
                huber_t: self.huber_t,
                min_points: self.min_points,
                max_iterations: self.max_iterations,
                fallback: clipped,
            })
        } else {
            Box::new(clipped)
        }
    }
}

/// A conversion function together with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConversion {
    /// the fitted function
    pub function: ConversionFunction,
    /// number of calibrator points used
    pub num_points: usize,
    /// everything that went wrong during the fit
    pub warnings: Vec<ReductionWarning>,
}

/// Result of the self-consistency check for one calibrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    /// calibrator source name
    pub source: String,
    /// number of rows of this source that could be checked
    pub num_rows: usize,
    /// mean of `(computed - tabulated) / tabulated`, `None` if no other
    /// calibrator was available
    pub mean_relative_difference: Option<f64>,
    /// whether the difference exceeds the tolerance
    pub inconsistent: bool,
}

type ConversionKey = (String, FluxUnit, Option<String>);

/// The calibration table and everything derived from it.
#[derive(Debug, Clone, Default)]
pub struct CalibrationModel {
    config: CalibrationConfig,
    registry: CalibratorRegistry,
    table: Vec<CalibratorObservation>,
    conversions: HashMap<ConversionKey, ChannelConversion>,
}

impl CalibrationModel {
    /// A model with an empty table.
    pub fn new(config: CalibrationConfig, registry: CalibratorRegistry) -> Self {
        Self {
            config,
            registry,
            table: vec![],
            conversions: HashMap::new(),
        }
    }

    /// The options in use.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// The calibrators known to this model.
    pub fn registry(&self) -> &CalibratorRegistry {
        &self.registry
    }

    /// The calibration table.
    pub fn table(&self) -> &[CalibratorObservation] {
        &self.table
    }

    /// Replace the calibration table, filling in missing fluxes and derived
    /// columns.
    pub fn set_table(&mut self, table: Vec<CalibratorObservation>) {
        self.table = table;
        self.update_table();
    }

    /// Append rows to the calibration table and update it.
    pub fn extend_table(&mut self, rows: impl IntoIterator<Item = CalibratorObservation>) {
        self.table.extend(rows);
        self.update_table();
    }

    /// Look up the tabulated flux of rows that lack one, recompute stale
    /// rows (`flux_over_counts == 0`) and drop every cached conversion.
    pub fn update_table(&mut self) {
        trace!("start update_table");
        for row in self.table.iter_mut().filter(|row| !row.is_calibrator()) {
            if let Some((flux, flux_err)) = self.registry.tabulated_flux(
                &row.source,
                row.frequency_mhz / 1000.0,
                row.bandwidth_mhz / 1000.0,
                Some(row.time_mjd),
            ) {
                row.flux_jy = flux;
                row.flux_err_jy = flux_err;
            }
        }
        let stale = self
            .table
            .iter()
            .positions(|row| row.is_calibrator() && row.flux_over_counts == 0.0)
            .collect_vec();
        debug!("update_table: recomputing {} stale rows", stale.len());
        for idx in stale {
            fit_counts_to_flux(std::slice::from_mut(&mut self.table[idx]));
        }
        self.conversions.clear();
        trace!("end update_table");
    }

    /// Fit the conversion function of `channel` in `unit`, leaving out the
    /// rows of `exclude_source`. Results are cached until the table changes.
    ///
    /// # Errors
    ///
    /// Will return [`CalibrationError::MissingPixelArea`] for Jy/pixel without
    /// a configured pixel size, and [`CalibrationError::NoCalibrators`] when no
    /// usable calibrator row remains.
    pub fn build_conversion(
        &mut self,
        channel: &str,
        unit: FluxUnit,
        exclude_source: Option<&str>,
    ) -> Result<ChannelConversion, CalibrationError> {
        let key = (
            channel.to_string(),
            unit,
            exclude_source.map(str::to_lowercase),
        );
        if let Some(conversion) = self.conversions.get(&key) {
            return Ok(conversion.clone());
        }

        let scale = match unit {
            FluxUnit::JyPerPixel => self
                .config
                .pixel_area_sr
                .ok_or(CalibrationError::MissingPixelArea)?,
            _ => 1.0,
        };

        let mut elevation = vec![];
        let mut ratio = vec![];
        let mut ratio_err = vec![];
        for row in self.table.iter().filter(|row| {
            row.channel == channel
                && row.is_calibrator()
                && exclude_source.map_or(true, |ex| !row.source.eq_ignore_ascii_case(ex))
        }) {
            let (value, error) = row.ratio(unit);
            if value > 0.0 && value.is_finite() {
                elevation.push(row.elevation_rad);
                ratio.push(value * scale);
                ratio_err.push(error * scale);
            }
        }
        if ratio.is_empty() {
            return Err(CalibrationError::NoCalibrators {
                channel: channel.into(),
                excluded: exclude_source.map(Into::into),
            });
        }

        let mut warnings = vec![];
        let function = self
            .config
            .fitter()
            .fit(&elevation, &ratio, &ratio_err, &mut warnings);
        debug!(
            "conversion for {channel} in {unit} (excluding {exclude_source:?}): {function:?}"
        );
        let conversion = ChannelConversion {
            function,
            num_points: ratio.len(),
            warnings,
        };
        self.conversions.insert(key, conversion.clone());
        Ok(conversion)
    }

    /// Conversion factor and uncertainty for `channel` at `elevation_rad`,
    /// using every calibrator.
    ///
    /// # Errors
    ///
    /// See [`CalibrationModel::build_conversion`].
    pub fn convert(
        &mut self,
        channel: &str,
        unit: FluxUnit,
        elevation_rad: f64,
    ) -> Result<(f64, f64), CalibrationError> {
        Ok(self
            .build_conversion(channel, unit, None)?
            .function
            .predict(elevation_rad))
    }

    /// Flux density in Jy of `row` predicted from a peak-counts conversion
    /// that leaves out the row's own source.
    fn predicted_flux(&mut self, idx: usize) -> Result<Option<(f64, f64)>, CalibrationError> {
        let (channel, source, counts, counts_err, elevation) = {
            let row = &self.table[idx];
            (
                row.channel.clone(),
                row.source.clone(),
                row.counts,
                row.counts_err,
                row.elevation_rad,
            )
        };
        match self.build_conversion(&channel, FluxUnit::JyPerBeam, Some(source.as_str())) {
            Ok(conversion) => {
                let (ratio, ratio_err) = conversion.function.predict(elevation);
                let flux = counts * ratio;
                let rel = (counts_err / counts).abs() + (ratio_err / ratio).abs();
                Ok(Some((flux, rel * flux.abs())))
            }
            Err(CalibrationError::NoCalibrators { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Fill `computed_flux_jy` for every row, calibrators included, using
    /// conversions that leave out the row's own source.
    ///
    /// Rows for which no conversion can be built get NaN and a warning.
    ///
    /// # Errors
    ///
    /// See [`CalibrationModel::build_conversion`].
    pub fn compute_source_fluxes(&mut self) -> Result<Vec<ReductionWarning>, CalibrationError> {
        let mut warnings = vec![];
        for idx in 0..self.table.len() {
            let (flux, flux_err) = match self.predicted_flux(idx)? {
                Some(prediction) => prediction,
                None => {
                    let row = &self.table[idx];
                    warnings.push(
                        ReductionWarning::degenerate(
                            "compute_source_fluxes",
                            format!(
                                "no calibrator other than {} in channel {}",
                                row.source, row.channel
                            ),
                        )
                        .emit(),
                    );
                    (f64::NAN, f64::NAN)
                }
            };
            let row = &mut self.table[idx];
            row.computed_flux_jy = flux;
            row.computed_flux_err_jy = flux_err;
        }
        Ok(warnings)
    }

    /// Check every calibrator against a conversion built from the others.
    ///
    /// `epsilon` defaults to the configured tolerance. Inconsistencies are
    /// logged and reported, never raised.
    ///
    /// # Errors
    ///
    /// See [`CalibrationModel::build_conversion`].
    pub fn check_consistency(
        &mut self,
        epsilon: Option<f64>,
    ) -> Result<Vec<ConsistencyReport>, CalibrationError> {
        let epsilon = epsilon.unwrap_or(self.config.consistency_epsilon);
        let sources = self
            .table
            .iter()
            .filter(|row| row.is_calibrator())
            .map(|row| row.source.clone())
            .unique()
            .collect_vec();

        let mut reports = vec![];
        for source in sources {
            let rows = self
                .table
                .iter()
                .positions(|row| row.is_calibrator() && row.source == source)
                .collect_vec();
            let mut differences = vec![];
            for idx in rows {
                if let Some((flux, _)) = self.predicted_flux(idx)? {
                    let tabulated = self.table[idx].flux_jy;
                    differences.push((flux - tabulated) / tabulated);
                }
            }
            let mean_relative_difference = if differences.is_empty() {
                None
            } else {
                Some(differences.iter().sum::<f64>() / differences.len() as f64)
            };
            let inconsistent = mean_relative_difference.map_or(false, |d| d.abs() > epsilon);
            if inconsistent {
                warn!(
                    "calibrator {source} is inconsistent with the others: mean relative difference {:.3}",
                    mean_relative_difference.unwrap_or_default()
                );
            }
            reports.push(ConsistencyReport {
                source,
                num_rows: differences.len(),
                mean_relative_difference,
                inconsistent,
            });
        }
        Ok(reports)
    }
}
