//! Known flux calibrators and their spectral models.

use std::f64::consts::LN_10;

use log::trace;

use crate::constants::{DEFAULT_COEFF_REL_ERR, FLUX_INTEGRATION_SUBBANDS, PERLEY_BUTLER_2010};

/// One tabulated flux density measurement of a calibrator.
#[derive(Debug, Clone, PartialEq)]
pub struct TabulatedFlux {
    /// centre frequency \[GHz\]
    pub frequency_ghz: f64,
    /// bandwidth \[GHz\]
    pub bandwidth_ghz: f64,
    /// flux density \[Jy\]
    pub flux_jy: f64,
    /// flux density uncertainty \[Jy\]
    pub flux_err_jy: f64,
    /// `(start, end)` MJD range in which the measurement is valid. `None` is
    /// valid at any time.
    pub valid_mjd: Option<(f64, f64)>,
}

impl TabulatedFlux {
    fn is_valid_at(&self, time_mjd: Option<f64>) -> bool {
        match (self.valid_mjd, time_mjd) {
            (Some((start, end)), Some(time)) => (start..=end).contains(&time),
            _ => true,
        }
    }
}

/// How the flux density of a calibrator depends on frequency.
#[derive(Debug, Clone, PartialEq)]
pub enum FluxModel {
    /// `log10(S/Jy) = Σ a_i log10(ν/GHz)^i`
    Coefficients {
        /// polynomial coefficients `a_i`, lowest order first
        coeffs: Vec<f64>,
        /// uncertainties of `a_i`; [`DEFAULT_COEFF_REL_ERR`] of `|a_i|` when
        /// absent
        errors: Option<Vec<f64>>,
    },
    /// Discrete measurements. The one closest in frequency is used, ties
    /// broken by the closest bandwidth.
    Table(Vec<TabulatedFlux>),
}

impl FluxModel {
    /// Band-averaged flux density and uncertainty in Jy at `frequency_ghz`
    /// over `bandwidth_ghz`, for an observation at `time_mjd`.
    ///
    /// Returns `None` when the model cannot provide a flux (no valid table
    /// row, or a non-positive frequency).
    pub fn flux(
        &self,
        frequency_ghz: f64,
        bandwidth_ghz: f64,
        time_mjd: Option<f64>,
    ) -> Option<(f64, f64)> {
        match self {
            Self::Coefficients { coeffs, errors } => {
                let default_errors;
                let errors = match errors {
                    Some(errors) => errors.as_slice(),
                    None => {
                        default_errors = coeffs
                            .iter()
                            .map(|a| a.abs() * DEFAULT_COEFF_REL_ERR)
                            .collect::<Vec<_>>();
                        default_errors.as_slice()
                    }
                };
                band_averaged_flux(coeffs, errors, frequency_ghz, bandwidth_ghz)
            }
            Self::Table(rows) => rows
                .iter()
                .filter(|row| row.is_valid_at(time_mjd))
                .min_by(|a, b| {
                    let key = |row: &TabulatedFlux| {
                        (
                            (row.frequency_ghz - frequency_ghz).abs(),
                            (row.bandwidth_ghz - bandwidth_ghz).abs(),
                        )
                    };
                    let (a_df, a_dbw) = key(a);
                    let (b_df, b_dbw) = key(b);
                    a_df.total_cmp(&b_df).then(a_dbw.total_cmp(&b_dbw))
                })
                .map(|row| (row.flux_jy, row.flux_err_jy)),
        }
    }
}

/// Evaluate the polynomial model at the centres of equal sub-bands and
/// average.
fn band_averaged_flux(
    coeffs: &[f64],
    errors: &[f64],
    frequency_ghz: f64,
    bandwidth_ghz: f64,
) -> Option<(f64, f64)> {
    let centres = if bandwidth_ghz > 0.0 {
        let df = bandwidth_ghz / FLUX_INTEGRATION_SUBBANDS as f64;
        let start = frequency_ghz - bandwidth_ghz / 2.0;
        (0..FLUX_INTEGRATION_SUBBANDS)
            .map(|idx| start + df * (idx as f64 + 0.5))
            .collect::<Vec<_>>()
    } else {
        vec![frequency_ghz]
    };

    let (mut sum_flux, mut sum_err, mut count) = (0.0, 0.0, 0usize);
    for nu in centres.into_iter().filter(|&nu| nu > 0.0) {
        let x = nu.log10();
        let (log_flux, err_sq) = coeffs.iter().zip(errors).enumerate().fold(
            (0.0, 0.0),
            |(log_flux, err_sq), (power, (a, e))| {
                let x_pow = x.powi(power as i32);
                (log_flux + a * x_pow, err_sq + (e * x_pow).powi(2))
            },
        );
        let flux = 10f64.powf(log_flux);
        sum_flux += flux;
        sum_err += flux * LN_10 * err_sq.sqrt();
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some((sum_flux / count as f64, sum_err / count as f64))
}

/// A known flux calibrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrator {
    /// canonical name, e.g. "3C286"
    pub name: String,
    /// other names the source is observed under
    pub aliases: Vec<String>,
    /// spectral model
    pub model: FluxModel,
}

impl Calibrator {
    /// Whether an observed source name refers to this calibrator
    /// (case-insensitive substring match on the name and aliases).
    pub fn matches(&self, source: &str) -> bool {
        let source = source.to_lowercase();
        std::iter::once(&self.name)
            .chain(&self.aliases)
            .any(|name| !name.is_empty() && source.contains(&name.to_lowercase()))
    }
}

/// The set of calibrators a reduction knows about.
///
/// Starts empty; call [`CalibratorRegistry::load_defaults`] for the
/// Perley & Butler (2010) sources.
#[derive(Debug, Clone, Default)]
pub struct CalibratorRegistry {
    calibrators: Vec<Calibrator>,
}

impl CalibratorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the default calibrators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.load_defaults();
        registry
    }

    /// Add the default calibrators (3C48, 3C138, 3C147, 3C286), replacing any
    /// entry of the same name.
    pub fn load_defaults(&mut self) {
        for (name, aliases, coeffs) in PERLEY_BUTLER_2010 {
            self.insert(Calibrator {
                name: (*name).to_string(),
                aliases: aliases.iter().map(|alias| (*alias).to_string()).collect(),
                model: FluxModel::Coefficients {
                    coeffs: coeffs.to_vec(),
                    errors: None,
                },
            });
        }
    }

    /// Forget every calibrator.
    pub fn reset(&mut self) {
        self.calibrators.clear();
    }

    /// Add a calibrator, replacing any entry with the same name.
    pub fn insert(&mut self, calibrator: Calibrator) {
        match self
            .calibrators
            .iter()
            .position(|known| known.name.eq_ignore_ascii_case(&calibrator.name))
        {
            Some(idx) => self.calibrators[idx] = calibrator,
            None => self.calibrators.push(calibrator),
        }
    }

    /// The first calibrator matching an observed source name.
    pub fn find(&self, source: &str) -> Option<&Calibrator> {
        self.calibrators.iter().find(|cal| cal.matches(source))
    }

    /// Tabulated flux density and uncertainty in Jy of `source`, or `None`
    /// if it is not a known calibrator (no calibration possible).
    pub fn tabulated_flux(
        &self,
        source: &str,
        frequency_ghz: f64,
        bandwidth_ghz: f64,
        time_mjd: Option<f64>,
    ) -> Option<(f64, f64)> {
        let calibrator = self.find(source)?;
        let flux = calibrator
            .model
            .flux(frequency_ghz, bandwidth_ghz, time_mjd);
        trace!("tabulated flux of {source} ({}): {flux:?}", calibrator.name);
        flux
    }

    /// Iterate over the known calibrators.
    pub fn iter(&self) -> impl Iterator<Item = &Calibrator> {
        self.calibrators.iter()
    }

    /// Number of known calibrators.
    pub fn len(&self) -> usize {
        self.calibrators.len()
    }

    /// Whether no calibrator is known.
    pub fn is_empty(&self) -> bool {
        self.calibrators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_3c286_at_one_ghz() {
        let registry = CalibratorRegistry::with_defaults();
        // log10(ν) = 0, so S = 10^a0
        let (flux, err) = registry.tabulated_flux("3C286", 1.0, 0.0, None).unwrap();
        assert_abs_diff_eq!(flux, 10f64.powf(1.2515), epsilon = 1e-9);
        assert_abs_diff_eq!(err, flux * LN_10 * 1.2515 * 0.05, epsilon = 1e-9);
    }

    #[test]
    fn test_band_average_of_power_law() {
        // S = 10 (ν/GHz)^-1 is linear in 1/ν; the sub-band average is close
        // to the point value for a narrow band
        let model = FluxModel::Coefficients {
            coeffs: vec![1.0, -1.0],
            errors: Some(vec![0.0, 0.0]),
        };
        let (narrow, err) = model.flux(5.0, 0.01, None).unwrap();
        assert_abs_diff_eq!(narrow, 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(err, 0.0);
        let (wide, _) = model.flux(5.0, 2.0, None).unwrap();
        assert!(wide > narrow);
    }

    #[test]
    fn test_lookup_is_case_insensitive_substring() {
        let registry = CalibratorRegistry::with_defaults();
        assert_eq!(registry.find("3c48_scan_2").unwrap().name, "3C48");
        assert_eq!(registry.find("J1331+3030").unwrap().name, "3C286");
        assert!(registry.find("W51").is_none());
        assert!(registry.tabulated_flux("W51", 7.0, 0.5, None).is_none());
    }

    #[test]
    fn test_table_selection() {
        let row = |frequency_ghz, bandwidth_ghz, flux_jy, valid_mjd| TabulatedFlux {
            frequency_ghz,
            bandwidth_ghz,
            flux_jy,
            flux_err_jy: 0.1,
            valid_mjd,
        };
        let model = FluxModel::Table(vec![
            row(5.0, 0.5, 1.0, None),
            row(5.0, 1.0, 2.0, None),
            row(7.0, 0.5, 3.0, Some((50000.0, 50100.0))),
            row(7.0, 0.5, 4.0, Some((50100.0, 50200.0))),
        ]);
        assert_abs_diff_eq!(model.flux(5.1, 0.9, None).unwrap().0, 2.0);
        assert_abs_diff_eq!(model.flux(4.9, 0.4, None).unwrap().0, 1.0);
        assert_abs_diff_eq!(model.flux(6.9, 0.5, Some(50150.0)).unwrap().0, 4.0);
        // only the rows valid at the time are considered
        assert_abs_diff_eq!(model.flux(6.9, 0.5, Some(50300.0)).unwrap().0, 1.0);
        assert!(FluxModel::Table(vec![]).flux(5.0, 0.5, None).is_none());
    }

    #[test]
    fn test_registry_lifecycle() {
        let mut registry = CalibratorRegistry::new();
        assert!(registry.is_empty());
        registry.load_defaults();
        assert_eq!(registry.len(), 4);
        registry.insert(Calibrator {
            name: "3c286".into(),
            aliases: vec![],
            model: FluxModel::Table(vec![]),
        });
        assert_eq!(registry.len(), 4);
        assert!(registry.tabulated_flux("3C286", 1.0, 0.0, None).is_none());
        registry.reset();
        assert!(registry.find("3C48").is_none());
    }
}
