//! Height providers used when a sensor model needs terrain heights.
//!
//! The engine treats elevation as a black box: anything implementing
//! [`ElevationSource`] can back ground-point seeding and terrain-aware ray
//! intersection.

use serde::{Deserialize, Serialize};

use super::ellipsoid::Ellipsoid;
use super::ray::EcefRay;
use super::GroundPoint;

/// Maximum number of height refinements in [`ElevationSource::intersect_ray`].
const MAX_RAY_ITERATIONS: usize = 20;

/// Provides heights above the ellipsoid.
pub trait ElevationSource {
    /// Height above the ellipsoid at the horizontal position of `point`, or `NaN` if unknown.
    fn height_above_ellipsoid(&self, point: &GroundPoint) -> f64;

    /// Intersects `ray` with the terrain by alternating ellipsoid intersections and height lookups.
    ///
    /// Holes in the elevation data fall back to the last valid height (the ellipsoid
    /// itself on the first pass). Returns `None` if the ray misses the Earth.
    fn intersect_ray(
        &self,
        ray: &EcefRay,
        ellipsoid: &Ellipsoid,
        tolerance_m: f64,
    ) -> Option<GroundPoint> {
        let mut height = 0.0;
        let mut point = ray.intersect_ground(height, ellipsoid)?;
        for _ in 0..MAX_RAY_ITERATIONS {
            let looked_up = self.height_above_ellipsoid(&point);
            if !looked_up.is_finite() {
                break;
            }
            let delta = looked_up - height;
            height = looked_up;
            point = ray.intersect_ground(height, ellipsoid)?;
            if delta.abs() < tolerance_m {
                break;
            }
        }
        point.height = height;
        Some(point)
    }
}

/// Flat terrain at a fixed height above the ellipsoid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantElevation {
    pub height: f64,
}

impl ConstantElevation {
    pub fn new(height: f64) -> Self {
        Self { height }
    }
}

impl ElevationSource for ConstantElevation {
    fn height_above_ellipsoid(&self, _point: &GroundPoint) -> f64 {
        self.height
    }
}

/// Regular lat/lon grid of heights with bilinear interpolation.
///
/// Row 0 is the northernmost row; `NaN` is returned outside the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridElevation {
    pub north_lat: f64,
    pub west_lon: f64,
    pub spacing_deg: f64,
    pub rows: usize,
    pub cols: usize,
    pub heights: Vec<f64>,
}

impl GridElevation {
    pub fn new(
        north_lat: f64,
        west_lon: f64,
        spacing_deg: f64,
        rows: usize,
        cols: usize,
        heights: Vec<f64>,
    ) -> Option<Self> {
        if heights.len() != rows * cols || rows < 2 || cols < 2 || spacing_deg <= 0.0 {
            return None;
        }
        Some(Self {
            north_lat,
            west_lon,
            spacing_deg,
            rows,
            cols,
            heights,
        })
    }

    fn at(&self, row: usize, col: usize) -> f64 {
        self.heights[row * self.cols + col]
    }
}

impl ElevationSource for GridElevation {
    fn height_above_ellipsoid(&self, point: &GroundPoint) -> f64 {
        let r = (self.north_lat - point.lat) / self.spacing_deg;
        let c = (point.lon - self.west_lon) / self.spacing_deg;
        if !r.is_finite()
            || !c.is_finite()
            || r < 0.0
            || c < 0.0
            || r > (self.rows - 1) as f64
            || c > (self.cols - 1) as f64
        {
            return f64::NAN;
        }
        let r0 = (r.floor() as usize).min(self.rows - 2);
        let c0 = (c.floor() as usize).min(self.cols - 2);
        let fr = r - r0 as f64;
        let fc = c - c0 as f64;
        let top = self.at(r0, c0) * (1.0 - fc) + self.at(r0, c0 + 1) * fc;
        let bottom = self.at(r0 + 1, c0) * (1.0 - fc) + self.at(r0 + 1, c0 + 1) * fc;
        top * (1.0 - fr) + bottom * fr
    }
}
