//! Iteration log and final solution report of a bundle run.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{AdjustmentError, SolutionStatus};
use crate::geometry::GroundPoint;
use crate::util::{write_csv, write_json, ProjectionError};

/// What one iteration did, logged as it happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: usize,
    pub seuw: f64,
    /// Largest absolute parameter correction, normalized units.
    pub max_parameter_correction: f64,
    /// Largest ground correction length, meters.
    pub max_ground_correction_m: f64,
    pub residual_rms_px: f64,
}

impl fmt::Display for IterationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iteration {:>3}: SEUW {:.6}, residual RMS {:.4} px, max parameter correction {:.3e}, max ground correction {:.4} m",
            self.iteration,
            self.seuw,
            self.residual_rms_px,
            self.max_parameter_correction,
            self.max_ground_correction_m
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub description: String,
    pub unit: String,
    pub initial_value: f64,
    pub value: f64,
    /// Physical offset applied by the model, in `unit`.
    pub offset: f64,
    /// A-priori sigma, in `unit`.
    pub sigma: f64,
    /// Posterior sigma, in `unit`, scaled by the final SEUW.
    pub posterior_sigma: Option<f64>,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub image_index: usize,
    pub image_id: String,
    pub model_type: String,
    pub parameters: Vec<ParameterSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSummary {
    pub id: String,
    pub initial_ground: GroundPoint,
    pub ground: GroundPoint,
    /// `(north, east, up)` meters from the initial to the final ground point.
    pub correction_m: [f64; 3],
    /// Posterior `(north, east, up)` sigmas, meters.
    pub posterior_sigma_m: Option<[f64; 3]>,
}

/// Final residual of one measurement, one CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualRecord {
    pub observation_id: String,
    pub image_index: usize,
    pub image_id: String,
    pub sample_residual: f64,
    pub line_residual: f64,
    /// `sqrt(r^T W r)`.
    pub standardized: f64,
    pub valid: bool,
}

/// Everything a caller needs to judge a finished (or interrupted) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionSummary {
    pub status: Option<SolutionStatus>,
    pub iterations: usize,
    pub seuw_history: Vec<f64>,
    pub degrees_of_freedom: usize,
    pub num_images: usize,
    pub num_observations: usize,
    pub num_measurements: usize,
    pub num_parameters: usize,
    pub images: Vec<ImageSummary>,
    pub observations: Vec<ObservationSummary>,
    pub residuals: Vec<ResidualRecord>,
    /// Pixel residual magnitudes; `None` when no measurement is valid.
    pub residual_statistics: Option<ProjectionError>,
    pub iteration_log: Vec<IterationSummary>,
}

impl SolutionSummary {
    pub fn final_seuw(&self) -> Option<f64> {
        self.seuw_history.last().copied()
    }

    pub fn write_json(&self, path: &str) -> Result<(), AdjustmentError> {
        write_json(path, self)?;
        Ok(())
    }

    pub fn write_residuals_csv(&self, path: &str) -> Result<(), AdjustmentError> {
        write_csv(path, &self.residuals)?;
        Ok(())
    }
}

impl fmt::Display for SolutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self
            .status
            .map_or_else(|| "Not run".to_string(), |s| s.to_string());
        writeln!(f, "Bundle adjustment: {status} after {} iterations", self.iterations)?;
        writeln!(
            f,
            "  images {}, observations {}, measurements {}, parameters {}, dof {}",
            self.num_images,
            self.num_observations,
            self.num_measurements,
            self.num_parameters,
            self.degrees_of_freedom
        )?;
        let history: Vec<String> = self.seuw_history.iter().map(|s| format!("{s:.6}")).collect();
        writeln!(f, "  SEUW history: [{}]", history.join(", "))?;
        for entry in &self.iteration_log {
            writeln!(f, "  {entry}")?;
        }
        for image in &self.images {
            writeln!(f, "Image {} ({}, {}):", image.image_index, image.image_id, image.model_type)?;
            for p in &image.parameters {
                let posterior = p
                    .posterior_sigma
                    .map_or_else(|| "-".to_string(), |s| format!("{s:.6}"));
                writeln!(
                    f,
                    "  {:<20} {:>12.6} {:<8} sigma {:>10.6} posterior {:>10}{}",
                    p.description,
                    p.offset,
                    p.unit,
                    p.sigma,
                    posterior,
                    if p.locked { " (locked)" } else { "" }
                )?;
            }
        }
        for o in &self.observations {
            writeln!(
                f,
                "Observation {}: correction N {:.4} E {:.4} U {:.4} m",
                o.id, o.correction_m[0], o.correction_m[1], o.correction_m[2]
            )?;
        }
        if let Some(stats) = &self.residual_statistics {
            writeln!(f, "Residuals: {stats:?}")?;
        }
        Ok(())
    }
}
