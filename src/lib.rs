//! Sensor Tools Library
//!
//! Photogrammetric sensor models and the solvers that refine them:
//! - Rational polynomial coefficient (RPC) model
//! - Frame camera model
//! - Pushbroom (line scanner) model with ephemeris and attitude
//!
//! Each model maps between image `(sample, line)` and geodetic ground
//! coordinates and exposes a store of sigma-scaled adjustable parameters. The
//! [`optimization`] module fits one model to tie points (self-calibration) or
//! replaces any model with a fitted RPC, and the [`adjustment`] module runs a
//! multi-image bundle adjustment.

pub mod adjustment;
pub mod geometry;
pub mod keywordlist;
pub mod linalg;
pub mod optimization;
pub mod sensor;
pub mod util;

// Re-export commonly used types
pub use adjustment::{
    AdjustmentError, BundleConfig, BundleExecutive, Measurement, Observation, ObservationSet,
    SolutionStatus, SolutionStrategy, SolutionSummary,
};
pub use geometry::{ConstantElevation, ElevationSource, GroundPoint, ImageRect};
pub use keywordlist::KeywordList;
pub use optimization::{FitConfig, FitError, ModelFitter, Optimizer, RpcOptimizationCost, TiePoint};
pub use sensor::{
    create_model, AnySensorModel, FrameModel, PushbroomModel, RpcModel, SensorModel,
    SensorModelError,
};
