//! Multi-image bundle adjustment.
//!
//! An [`ObservationSet`] ties ground features to their measured positions in
//! several images. The [`BundleExecutive`] jointly refines every image's
//! adjustable parameters and every observation's ground position by iterated
//! weighted least squares, delegating each linear solve to a pluggable
//! [`SolutionStrategy`], and classifies the run as converged, diverged or out of
//! iterations from the standard error of unit weight (SEUW).
//!
//! The unknown vector is laid out image by image (all adjustable parameters of
//! image 0, then image 1, ...) followed by a local `(north, east, up)` correction
//! in meters for every observation, in observation order.

use std::fmt;
use std::fs;

use serde::{Deserialize, Serialize};

pub mod executive;
pub mod observation;
pub mod report;
pub mod solution;

pub use executive::BundleExecutive;
pub use observation::{Evaluation, Measurement, Observation, ObservationSet};
pub use report::{IterationSummary, ResidualRecord, SolutionSummary};
pub use solution::{
    MeasurementBlock, NormalEquationState, RobustLeastSquares, SolutionStrategy,
    WeightedLeastSquares,
};

use crate::linalg::{LinAlgError, DEFAULT_RANK_TOLERANCE};
use crate::sensor::SensorModelError;
use crate::util::UtilError;

#[derive(thiserror::Error, Debug)]
pub enum AdjustmentError {
    #[error("Observation set has no observations")]
    EmptyObservationSet,
    #[error("Observation {0} has no measurements")]
    ObservationWithoutMeasurements(String),
    #[error("Image index {index} is out of range ({images} images)")]
    ImageIndexOutOfRange { index: usize, images: usize },
    #[error("Missing or invalid covariance: {0}")]
    MissingCovariance(String),
    #[error("Parameter count changed: expected {expected}, found {found}")]
    MismatchedParameterCount { expected: usize, found: usize },
    #[error("Ground point of observation {0} could not be seeded")]
    SeedFailed(String),
    #[error("Bundle adjustment has not been initialized")]
    NotInitialized,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Numeric error: {0}")]
    Numeric(#[from] LinAlgError),
    #[error("Sensor model error: {0}")]
    Model(#[from] SensorModelError),
    #[error("Report error: {0}")]
    Report(String),
}

impl From<UtilError> for AdjustmentError {
    fn from(err: UtilError) -> Self {
        AdjustmentError::Report(err.to_string())
    }
}

/// Terminal outcome of [`BundleExecutive::run_solution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolutionStatus {
    Converged,
    Diverged,
    MaxIterExceeded,
    Cancelled,
}

impl fmt::Display for SolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolutionStatus::Converged => write!(f, "Converged"),
            SolutionStatus::Diverged => write!(f, "Diverged"),
            SolutionStatus::MaxIterExceeded => write!(f, "Maximum iterations exceeded"),
            SolutionStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Lifecycle of a [`BundleExecutive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutiveState {
    Uninitialized,
    Initialized,
    Iterating,
    Finished(SolutionStatus),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    WeightedLeastSquares,
    RobustLeastSquares,
}

/// Settings of the bundle executive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub max_iterations: usize,
    /// Relative SEUW change, in percent, at or below which the solution has converged.
    pub convergence_criteria: f64,
    /// Finite-difference step of parameter partials, normalized units.
    pub parameter_derivative_step: f64,
    /// Finite-difference step of ground partials, meters.
    pub ground_derivative_step_m: f64,
    pub rank_tolerance: f64,
    pub solution_strategy: StrategyKind,
    /// Standardized residual above which the robust strategy downweights a measurement.
    pub huber_threshold: f64,
    pub trace_partials: bool,
    pub trace_corrections: bool,
    pub verbose: bool,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_iterations: 7,
            convergence_criteria: 0.1,
            parameter_derivative_step: 1e-4,
            ground_derivative_step_m: 1.0,
            rank_tolerance: DEFAULT_RANK_TOLERANCE,
            solution_strategy: StrategyKind::WeightedLeastSquares,
            huber_threshold: 3.0,
            trace_partials: false,
            trace_corrections: false,
            verbose: false,
        }
    }
}

impl BundleConfig {
    pub fn from_yaml_file(path: &str) -> Result<Self, AdjustmentError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| AdjustmentError::InvalidConfig(format!("{path}: {e}")))?;
        let config: BundleConfig = serde_yaml::from_str(&contents)
            .map_err(|e| AdjustmentError::InvalidConfig(format!("{path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AdjustmentError> {
        if self.max_iterations == 0 {
            return Err(AdjustmentError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let steps = [
            ("parameter_derivative_step", self.parameter_derivative_step),
            ("ground_derivative_step_m", self.ground_derivative_step_m),
            ("huber_threshold", self.huber_threshold),
        ];
        for (name, value) in steps {
            if !(value > 0.0 && value.is_finite()) {
                return Err(AdjustmentError::InvalidConfig(format!(
                    "{name} must be positive"
                )));
            }
        }
        if !(self.convergence_criteria >= 0.0) {
            return Err(AdjustmentError::InvalidConfig(
                "convergence_criteria must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Solution strategy selected by `solution_strategy`.
    pub fn make_strategy(&self) -> Box<dyn SolutionStrategy> {
        match self.solution_strategy {
            StrategyKind::WeightedLeastSquares => Box::new(WeightedLeastSquares),
            StrategyKind::RobustLeastSquares => Box::new(RobustLeastSquares {
                threshold: self.huber_threshold,
            }),
        }
    }
}
