use crate::geometry::GroundPoint;
use crate::sensor::SensorModel;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Ensure the output directory exists
pub fn ensure_output_dir() -> Result<(), UtilError> {
    let output_dir = Path::new("output");
    if !output_dir.exists() {
        fs::create_dir_all(output_dir).map_err(|e| {
            UtilError::InvalidParams(format!("Failed to create output directory: {e}"))
        })?;
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("JSON error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for UtilError {
    fn from(err: std::io::Error) -> Self {
        UtilError::IOError(err.to_string())
    }
}

impl From<csv::Error> for UtilError {
    fn from(err: csv::Error) -> Self {
        UtilError::CsvError(err.to_string())
    }
}

impl From<serde_json::Error> for UtilError {
    fn from(err: serde_json::Error) -> Self {
        UtilError::JsonError(err.to_string())
    }
}

/// Summary statistics of a set of residual magnitudes.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Statistics over `errors`. Non-finite entries are skipped.
pub fn compute_error_statistics(errors: &[f64]) -> Result<ProjectionError, UtilError> {
    let errors: Vec<f64> = errors.iter().copied().filter(|e| e.is_finite()).collect();
    if errors.is_empty() {
        return Err(UtilError::ZeroProjectionPoints);
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sorted_errors = errors;
    sorted_errors.sort_by(f64::total_cmp);
    let mid = sorted_errors.len() / 2;
    let median = if sorted_errors.len() % 2 == 0 {
        (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
    } else {
        sorted_errors[mid]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev,
        median,
    })
}

/// Pixel distance between each observed image point and the projection of its
/// ground point. Points the model cannot project are skipped.
pub fn compute_reprojection_error<M>(
    model: &M,
    ground_points: &[GroundPoint],
    image_points: &[Vector2<f64>],
) -> Result<ProjectionError, UtilError>
where
    M: ?Sized + SensorModel,
{
    if ground_points.len() != image_points.len() {
        return Err(UtilError::InvalidParams(format!(
            "{} ground points but {} image points",
            ground_points.len(),
            image_points.len()
        )));
    }
    let errors: Vec<f64> = ground_points
        .iter()
        .zip(image_points)
        .map(|(g, p)| (model.world_to_line_sample(g) - p).norm())
        .collect();
    compute_error_statistics(&errors)
}

/// Writes `value` as pretty-printed JSON.
pub fn write_json<T: Serialize>(path: &str, value: &T) -> Result<(), UtilError> {
    let json = serde_json::to_string_pretty(value)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Writes one CSV row per record, with a header derived from the field names.
pub fn write_csv<T: Serialize>(path: &str, records: &[T]) -> Result<(), UtilError> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
