use crate::gam::basis::BasisError;
use crate::gam::estimate::FitError;
use crate::records::{EntityKind, Handedness};
use std::fmt;
use thiserror::Error;

/// Which model a fit error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Surface,
    Effects,
}

impl Stage {
    pub fn fit_error(self, source: FitError) -> Error {
        Error::Fit {
            stage: self,
            source,
        }
    }

    pub fn input_error(self, source: InputError) -> Error {
        Error::Input {
            stage: self,
            source,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Surface => "surface",
            Stage::Effects => "effects",
        })
    }
}

/// Records or annotated rows that violate the input contract of a fit.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Row {row}: the {kind} id is missing.")]
    MissingEntityId { row: usize, kind: EntityKind },

    #[error("Row {row}: {field} location is not finite ({value}).")]
    NonFiniteLocation {
        row: usize,
        field: &'static str,
        value: f64,
    },

    #[error("Row {row}: fitted probability {value} is not a finite value in [0, 1].")]
    ProbabilityOutOfRange { row: usize, value: f64 },

    #[error("Requested a sample of {requested} rows but only {available} records are available.")]
    SampleSizeTooLarge { requested: usize, available: usize },

    #[error("Requested a sample of 0 rows from {available} records; at least one row is required.")]
    ZeroSampleSize { available: usize },
}

/// A point the fitted surface cannot be evaluated at.
#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Point {index}: {field} level '{level}' did not occur when the surface was fitted.")]
    UnseenLevel {
        index: usize,
        field: &'static str,
        level: Handedness,
    },

    #[error("Point {index}: location ({horizontal}, {vertical}) is not finite.")]
    NonFiniteLocation {
        index: usize,
        horizontal: f64,
        vertical: f64,
    },

    #[error("Basis evaluation failed during prediction: {0}")]
    Basis(#[from] BasisError),
}

/// Error returned by the fitting stages of the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input to the {stage} model: {source}")]
    Input {
        stage: Stage,
        #[source]
        source: InputError,
    },

    #[error("Fitting the {stage} model failed: {source}")]
    Fit {
        stage: Stage,
        #[source]
        source: FitError,
    },

    #[error(transparent)]
    Prediction(#[from] PredictionError),
}
