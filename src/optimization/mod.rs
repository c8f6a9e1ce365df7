//! The `optimization` module refines sensor models against observations.
//!
//! Two tasks live here:
//!
//! 1. [`ModelFitter`]: self-calibration of one sensor model. The model's free
//!    adjustable parameters are solved by Levenberg-Marquardt against a set of
//!    [`TiePoint`]s, with finite-difference (or analytic, where the model
//!    provides them) Jacobians.
//! 2. [`RpcOptimizationCost`]: replacement-model generation. Any sensor model is
//!    sampled over an image grid and several height layers and an RPC is fitted to
//!    it, first by linear estimation and then by `tiny_solver` Levenberg-Marquardt.
//!
//! Both implement the [`Optimizer`] trait.

use std::fs;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

pub mod fitter;
pub mod rpc_solver;

pub use fitter::ModelFitter;
pub use rpc_solver::RpcOptimizationCost;

use crate::geometry::GroundPoint;
use crate::linalg::LinAlgError;
use crate::sensor::SensorModelError;
use crate::util::{ProjectionError, UtilError};

#[derive(thiserror::Error, Debug)]
pub enum FitError {
    #[error("No observations to fit")]
    NoObservations,
    #[error("Parameter {index} ({description}) is not observable from the tie points")]
    UnobservableParameter { index: usize, description: String },
    #[error("Numeric error: {0}")]
    Numeric(#[from] LinAlgError),
    #[error("Sensor model error: {0}")]
    Model(#[from] SensorModelError),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<UtilError> for FitError {
    fn from(err: UtilError) -> Self {
        FitError::NumericalError(err.to_string())
    }
}

/// What a tie-point residual measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualSpace {
    /// Observed pixel minus projected ground point (2 rows, pixels).
    Image,
    /// North/east offset of the back-projected pixel from the ground point (2 rows, meters).
    Ground,
    /// Ground height minus the height where the imaging ray passes the point (1 row, meters).
    Height,
}

impl ResidualSpace {
    pub fn rows_per_point(&self) -> usize {
        match self {
            ResidualSpace::Image | ResidualSpace::Ground => 2,
            ResidualSpace::Height => 1,
        }
    }
}

/// Settings of the single-model fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub max_iterations: usize,
    /// Stop once the mean squared residual drops below this.
    pub min_residual: f64,
    /// Stop once the relative step length drops below this.
    pub min_delta: f64,
    /// Initial damping as a fraction of the largest normal-matrix diagonal.
    pub initial_damping_scale: f64,
    /// Factor by which damping grows after a rejected step.
    pub damping_speed: f64,
    /// Finite-difference step, normalized parameter units.
    pub derivative_step: f64,
    pub residual_space: ResidualSpace,
    /// Exclude parameters with a (near) zero Jacobian column instead of failing.
    pub auto_lock_unobservable: bool,
    /// Column energy, relative to the strongest column, below which a parameter
    /// counts as unobservable.
    pub unobservable_tolerance: f64,
    pub verbose: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            min_residual: 1e-10,
            min_delta: 1e-10,
            initial_damping_scale: 1e-3,
            damping_speed: 2.0,
            derivative_step: 1e-4,
            residual_space: ResidualSpace::Image,
            auto_lock_unobservable: true,
            unobservable_tolerance: 1e-12,
            verbose: false,
        }
    }
}

impl FitConfig {
    pub fn from_yaml_file(path: &str) -> Result<Self, FitError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| FitError::InvalidConfig(format!("{path}: {e}")))?;
        let config: FitConfig = serde_yaml::from_str(&contents)
            .map_err(|e| FitError::InvalidConfig(format!("{path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FitError> {
        if self.derivative_step <= 0.0 || !self.derivative_step.is_finite() {
            return Err(FitError::InvalidConfig(
                "derivative_step must be positive".to_string(),
            ));
        }
        if self.damping_speed <= 1.0 {
            return Err(FitError::InvalidConfig(
                "damping_speed must be greater than 1".to_string(),
            ));
        }
        if self.initial_damping_scale < 0.0 {
            return Err(FitError::InvalidConfig(
                "initial_damping_scale must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// A ground feature with its observed image position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TiePoint {
    pub image_point: Vector2<f64>,
    pub ground_point: GroundPoint,
}

impl TiePoint {
    pub fn new(image_point: Vector2<f64>, ground_point: GroundPoint) -> Self {
        Self {
            image_point,
            ground_point,
        }
    }
}

/// Outcome of a single-model fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub iterations: usize,
    pub converged: bool,
    pub cancelled: bool,
    pub initial_rms: f64,
    pub final_rms: f64,
    /// Sum of squared residuals over the degrees of freedom.
    pub variance: f64,
    /// Parameters left out of this solve because they were not observable.
    pub unobservable_parameters: Vec<usize>,
    pub parameter_values: Vec<f64>,
}

/// A trait for sensor-model optimization tasks.
pub trait Optimizer {
    /// Runs the nonlinear refinement and writes the result into the held model.
    fn optimize(&mut self, verbose: bool) -> Result<(), FitError>;

    /// Computes a first estimate by solving a linearized system once.
    fn linear_estimation(&mut self) -> Result<(), FitError>
    where
        Self: Sized;

    /// Pixel reprojection statistics of the held model against its observations.
    fn fit_error(&self) -> Result<ProjectionError, FitError>;
}
