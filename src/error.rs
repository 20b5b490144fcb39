//! Errors and non-fatal diagnostics shared across the crate.

use std::fmt::{Display, Formatter};

use log::warn;
use thiserror::Error;

use crate::{
    calibration::CalibrationError, cleaning::CleanError, global_fit::GlobalFitError,
    image::ImageError,
};

#[derive(Error, Debug)]
/// All the hard errors a reduction can produce.
pub enum ReductionError {
    #[error(transparent)]
    /// Error while cleaning a dynamical spectrum
    Clean(#[from] CleanError),

    #[error(transparent)]
    /// Error while deriving the flux calibration
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    /// Error while fitting baselines to a whole map
    GlobalFit(#[from] GlobalFitError),

    #[error(transparent)]
    /// Error while accumulating an image
    Image(#[from] ImageError),

    #[error(transparent)]
    /// Error for bad array shape in provided argument
    BadArrayShape(#[from] BadArrayShape),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
/// Error for bad array shape in provided argument
pub struct BadArrayShape {
    /// The argument name within the function
    pub argument: String,
    /// The function name
    pub function: String,
    /// The expected shape
    pub expected: String,
    /// The shape that was received instead
    pub received: String,
}

/// A problem that did not stop the reduction, but which the caller may want to
/// know about.
///
/// Every warning is logged when it is raised (see [`ReductionWarning::emit`])
/// and also kept in the `warnings` field of the result it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionWarning {
    /// Too few samples for the requested fit; a simpler fallback was used.
    DegenerateInput {
        /// Where it happened
        context: String,
        /// What was done instead
        detail: String,
    },
    /// The fit ran, but its result should not be trusted blindly.
    UnreliableFit {
        /// Where it happened
        context: String,
        /// Why the fit is suspect
        detail: String,
    },
}

impl ReductionWarning {
    pub(crate) fn degenerate(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::DegenerateInput {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn unreliable(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnreliableFit {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Log the warning and hand it back, so it can be pushed onto a result.
    pub(crate) fn emit(self) -> Self {
        warn!("{self}");
        self
    }
}

impl Display for ReductionWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DegenerateInput { context, detail } => {
                write!(f, "{context}: degenerate input, {detail}")
            }
            Self::UnreliableFit { context, detail } => {
                write!(f, "{context}: unreliable fit, {detail}")
            }
        }
    }
}
