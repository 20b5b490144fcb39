//! Reducing a set of drift scans into a map.
use std::fmt::Display;

use derive_builder::Builder;
use itertools::Itertools;
use log::{debug, trace};

use crate::{
    calibration::{CalibrationModel, FluxUnit},
    cleaning::{ChannelSpectrum, CleanConfig, CleanedSpectrum, SpectralCleaner},
    error::{BadArrayShape, ReductionError, ReductionWarning},
    global_fit::{ExcludedRegion, GlobalBaselineFitter, GlobalFit, GlobalFitConfig, ScanRecord},
    image::{accumulate, Image, PixelGrid},
};

/// The raw data of one scan across the map: a dynamical spectrum per channel
/// plus the pointing of every time sample.
#[derive(Debug, Clone)]
pub struct DriftScan<'a> {
    /// scan identifier
    pub id: String,
    /// dynamical spectra, `[time][frequency]`
    pub channels: Vec<ChannelSpectrum<'a>>,
    /// sample times \[s\]
    pub time: Vec<f64>,
    /// x coordinate of each sample, in grid units
    pub x: Vec<f64>,
    /// y coordinate of each sample, in grid units
    pub y: Vec<f64>,
    /// total bandwidth of the spectra \[MHz\]
    pub bandwidth_mhz: f64,
    /// mean elevation of the scan \[rad\]
    pub elevation_rad: f64,
}

/// Options for reducing drift scans.
#[derive(Builder, Debug, Default, Clone)]
pub struct ReductionContext {
    /// Whether to flag RFI in the dynamical spectra
    #[builder(default = "true")]
    pub clean_spectra: bool,
    /// Options of the RFI cleaning
    #[builder(default)]
    pub clean: CleanConfig,
    /// Bins that are always retained, e.g. a spectral line
    #[builder(default)]
    pub keep_mask: Option<Vec<bool>>,

    /// Whether to fit a global baseline solution to the scans
    #[builder(default = "true")]
    pub fit_baselines: bool,
    /// Options of the global baseline fit
    #[builder(default)]
    pub global_fit: GlobalFitConfig,
    /// Regions of the map left out of the baseline fit
    #[builder(default)]
    pub excluded_regions: Vec<ExcludedRegion>,

    /// Unit to calibrate the map into, if any
    #[builder(default)]
    pub flux_unit: Option<FluxUnit>,

    /// Whether to draw progress bars
    #[builder(default = "false")]
    pub draw_progress: bool,
}

impl Display for ReductionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.clean_spectra {
            writeln!(f, "Will clean spectra with {}.", self.clean)?;
        } else {
            writeln!(f, "Will not clean spectra.")?;
        }
        if let Some(keep_mask) = &self.keep_mask {
            writeln!(
                f,
                "Will always keep {} frequency bins.",
                keep_mask.iter().filter(|&&keep| keep).count()
            )?;
        }
        if self.fit_baselines {
            writeln!(
                f,
                "Will fit baselines ({}), excluding {} regions.",
                self.global_fit,
                self.excluded_regions.len()
            )?;
        } else {
            writeln!(f, "Will not fit baselines.")?;
        }
        match self.flux_unit {
            Some(unit) => writeln!(f, "Will calibrate into {unit}.")?,
            None => writeln!(f, "Will not calibrate.")?,
        }
        Ok(())
    }
}

/// Everything a reduction produces.
#[derive(Debug, Clone)]
pub struct Reduction {
    /// cleaned channels of every scan, in input order
    pub cleaned: Vec<Vec<(String, CleanedSpectrum)>>,
    /// the global baseline fit, if it was run
    pub fit: Option<GlobalFit>,
    /// final counts (or flux) of every scan
    pub light_curves: Vec<Vec<f64>>,
    /// the map
    pub image: Image,
    /// every warning raised along the way
    pub warnings: Vec<ReductionWarning>,
}

impl ReductionContext {
    /// A one line description of the tasks the reduction will do.
    pub fn as_comment(&self) -> String {
        [
            if self.clean_spectra {
                Some(format!(
                    "RFI cleaning at {} sigma",
                    self.clean.noise_threshold_sigma
                ))
            } else {
                None
            },
            self.keep_mask.as_ref().map(|_| "keep mask".to_string()),
            if self.fit_baselines {
                Some("global baseline fit".to_string())
            } else {
                None
            },
            self.flux_unit
                .map(|unit| format!("calibration to {unit}")),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<String>>()
        .join(", ")
    }

    /// Reduce `scans` into a map of `channel` on `grid`.
    ///
    /// Each scan is cleaned (total-power masks are shared with the
    /// cross-polarisation channels of the same feed), its light curve in
    /// `channel` is fit with a global baseline solution, calibrated if a flux
    /// unit is set, and binned onto the grid.
    ///
    /// # Errors
    ///
    /// will wrap errors from [`SpectralCleaner::clean_feed`],
    /// [`GlobalBaselineFitter::fit`], [`CalibrationModel::convert`] and
    /// [`accumulate`], and fails with [`BadArrayShape`] when a scan lacks
    /// `channel` or its pointing does not match its spectra.
    pub fn reduce(
        &self,
        scans: &[DriftScan],
        channel: &str,
        grid: &PixelGrid,
        mut calibration: Option<&mut CalibrationModel>,
    ) -> Result<Reduction, ReductionError> {
        trace!("start reduce");
        let mut warnings = vec![];
        let cleaner = SpectralCleaner::new(CleanConfig {
            disable_filtering: !self.clean_spectra || self.clean.disable_filtering,
            ..self.clean.clone()
        });

        let mut cleaned = Vec::with_capacity(scans.len());
        let mut records = Vec::with_capacity(scans.len());
        for scan in scans {
            let duration_s = match (scan.time.first(), scan.time.last()) {
                (Some(first), Some(last)) => last - first,
                _ => 0.0,
            };
            let channels = cleaner.clean_feed(
                &scan.channels,
                duration_s,
                scan.bandwidth_mhz,
                self.keep_mask.as_deref(),
            )?;
            let (_, spectrum) = channels
                .iter()
                .find(|(name, _)| name == channel)
                .ok_or_else(|| BadArrayShape {
                    argument: "scans".into(),
                    function: "ReductionContext::reduce".into(),
                    expected: format!("a channel named {channel} in scan {}", scan.id),
                    received: format!(
                        "channels {}",
                        channels.iter().map(|(name, _)| name).join(", ")
                    ),
                })?;
            if spectrum.light_curve.len() != scan.time.len() {
                return Err(BadArrayShape {
                    argument: "scans".into(),
                    function: "ReductionContext::reduce".into(),
                    expected: format!("({},) time samples in scan {}", scan.time.len(), scan.id),
                    received: format!("({},)", spectrum.light_curve.len()),
                }
                .into());
            }
            warnings.extend(spectrum.warnings.iter().cloned());
            // the global fit removes the baselines itself
            let counts = if self.fit_baselines {
                spectrum.raw_light_curve.clone()
            } else {
                spectrum.light_curve.clone()
            };
            records.push(ScanRecord::new(
                scan.id.clone(),
                scan.time.clone(),
                scan.x.clone(),
                scan.y.clone(),
                counts,
            ));
            cleaned.push(channels);
        }
        debug!("reduce: cleaned {} scans", records.len());

        let fit = if self.fit_baselines {
            let fitter = GlobalBaselineFitter::new(GlobalFitConfig {
                draw_progress: self.draw_progress || self.global_fit.draw_progress,
                ..self.global_fit.clone()
            });
            let fit = fitter.fit(&records, grid, &self.excluded_regions, None)?;
            warnings.extend(fit.warnings.iter().cloned());
            Some(fit)
        } else {
            None
        };
        let mut light_curves = match &fit {
            Some(fit) => fit.corrected.clone(),
            None => records.iter().map(|record| record.counts.clone()).collect(),
        };

        if let (Some(unit), Some(model)) = (self.flux_unit, calibration.as_deref_mut()) {
            for (scan, light_curve) in scans.iter().zip(light_curves.iter_mut()) {
                let (ratio, _) = model.convert(channel, unit, scan.elevation_rad)?;
                light_curve.iter_mut().for_each(|value| *value *= ratio);
            }
        }

        let x = scans.iter().flat_map(|scan| scan.x.iter().copied()).collect_vec();
        let y = scans.iter().flat_map(|scan| scan.y.iter().copied()).collect_vec();
        let values = light_curves.iter().flatten().copied().collect_vec();
        let image = accumulate(&x, &y, &values, None, grid)?;
        trace!("end reduce");

        Ok(Reduction {
            cleaned,
            fit,
            light_curves,
            image,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    use super::*;
    use crate::{
        calibration::{CalibrationConfig, CalibratorObservation, CalibratorRegistry},
        cleaning::Polarization,
    };

    #[test]
    fn test_display_and_comment() {
        let context = ReductionContextBuilder::default()
            .fit_baselines(false)
            .flux_unit(Some(FluxUnit::JyPerBeam))
            .build()
            .unwrap();
        let display = context.to_string();
        assert!(display.contains("Will clean spectra"));
        assert!(display.contains("Will not fit baselines."));
        assert!(display.contains("Will calibrate into Jy/beam."));
        assert_eq!(
            context.as_comment(),
            "RFI cleaning at 5 sigma, calibration to Jy/beam"
        );
    }

    #[test]
    fn test_reduce_flat_scans() {
        // two scans along the same row, one with an offset of 2 counts per bin
        let spectra = [
            Array2::from_elem((20, 16), 1.0),
            Array2::from_elem((20, 16), 3.0),
        ];
        let scans = spectra
            .iter()
            .enumerate()
            .map(|(idx, spectrum)| DriftScan {
                id: format!("scan{idx}"),
                channels: vec![ChannelSpectrum {
                    name: "Feed0_LCP".into(),
                    feed: 0,
                    polarization: Polarization::Lcp,
                    spectrum: spectrum.view(),
                }],
                time: (0..20).map(|t| t as f64).collect(),
                x: (0..20).map(|t| t as f64 / 4.0).collect(),
                y: vec![0.5; 20],
                bandwidth_mhz: 16.0,
                elevation_rad: 0.5,
            })
            .collect_vec();
        let grid = PixelGrid::regular((0.0, 5.0), 5, (0.0, 1.0), 1).unwrap();

        let mut model =
            CalibrationModel::new(CalibrationConfig::default(), CalibratorRegistry::new());
        model.set_table(vec![CalibratorObservation {
            counts: 10.0,
            flux_jy: 20.0,
            elevation_rad: 0.5,
            channel: "Feed0_LCP".into(),
            source: "CAL".into(),
            ..Default::default()
        }]);
        let context = ReductionContextBuilder::default()
            .flux_unit(Some(FluxUnit::JyPerBeam))
            .build()
            .unwrap();
        let reduction = context
            .reduce(&scans, "Feed0_LCP", &grid, Some(&mut model))
            .unwrap();
        assert_eq!(reduction.cleaned.len(), 2);
        let fit = reduction.fit.unwrap();
        // bins 1..14 are in the default band, 2 counts apart in each
        assert_abs_diff_eq!(
            fit.params.intercept(1) - fit.params.intercept(0),
            26.0,
            epsilon = 1e-3
        );
        for (_, _, variance) in reduction.image.valid_pixels() {
            assert_abs_diff_eq!(variance, 0.0, epsilon = 1e-6);
        }
    }
}
