#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]

//! Driftscan is a library of the reduction steps applied to single-dish radio drift scans:
//! cleaning dynamical spectra from radio-frequency interference, converting counts into flux
//! densities with calibrator observations, and fitting scan baselines so that all scans of a map
//! agree.
//!
//! # Examples
//!
//! Here's an example of how to clean the dynamical spectrum of a scan
//!
//! ```rust
//! use driftscan::{
//!     cleaning::{BandSelection, CleanConfigBuilder, SpectralCleaner},
//!     ndarray::Array2,
//! };
//!
//! // 64 time samples of a 32-bin spectrum, with an interfering signal in bin 12
//! let spectrum = Array2::from_shape_fn((64, 32), |(t, f)| {
//!     let noise = ((t * 7 + f * 13) % 5) as f64 * 0.1;
//!     if f == 12 && t % 2 == 0 {
//!         500.0
//!     } else {
//!         10.0 + noise
//!     }
//! });
//!
//! let config = CleanConfigBuilder::default()
//!     .band(BandSelection::All)
//!     .build()
//!     .unwrap();
//! let cleaned = SpectralCleaner::new(config)
//!     .clean(spectrum.view(), 6.4, 32.0, None)
//!     .unwrap();
//!
//! assert!(!cleaned.mask[12]);
//! assert_eq!(cleaned.light_curve.len(), 64);
//! ```
//!
//! # Details
//!
//! The steps are independent: [`cleaning`] turns dynamical spectra into light curves,
//! [`calibration`] turns counts into Jansky, [`global_fit`] removes scan baselines and
//! [`image`] bins samples onto a map. [`preprocessing::ReductionContext`] chains them.
//!
//! Problems that do not stop a step are returned as [`ReductionWarning`]s in its result, and are
//! also logged through the [`log`] facade.

pub mod calibration;
pub mod cleaning;
pub mod constants;
pub mod error;
pub mod global_fit;
pub mod image;
pub mod optimize;
pub mod preprocessing;
pub mod util;

pub use calibration::{
    CalibrationConfig, CalibrationConfigBuilder, CalibrationError, CalibrationModel,
    CalibratorObservation, CalibratorRegistry, ConversionFunction, FluxUnit,
};
pub use cleaning::{
    BandSelection, CleanConfig, CleanConfigBuilder, CleanError, CleanedSpectrum, SpectralCleaner,
};
pub use error::{BadArrayShape, ReductionError, ReductionWarning};
pub use global_fit::{
    BaselineParameters, ExcludedRegion, GlobalBaselineFitter, GlobalFit, GlobalFitConfig,
    GlobalFitConfigBuilder, GlobalFitError, ScanRecord,
};
pub use image::{accumulate, Image, ImageError, PixelGrid};
pub use preprocessing::{DriftScan, Reduction, ReductionContext, ReductionContextBuilder};

pub use itertools;
pub use ndarray;
