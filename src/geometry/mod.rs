//! Geometric primitives shared by the sensor models and the adjustment code.
//!
//! Image points are `nalgebra::Vector2<f64>` with `x` = sample and `y` = line.
//! Ground points are geodetic ([`GroundPoint`]) on the WGS-84 ellipsoid unless a
//! model carries its own [`Ellipsoid`].

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod bilinear;
pub mod elevation;
pub mod ellipsoid;
pub mod ray;

pub use bilinear::BilinearProjection;
pub use elevation::{ConstantElevation, ElevationSource, GridElevation};
pub use ellipsoid::{Ellipsoid, WGS84};
pub use ray::EcefRay;

/// Geodetic position: latitude and longitude in degrees, height above the ellipsoid in meters.
///
/// Any coordinate may be `NaN` to mark an unknown or failed position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundPoint {
    pub lat: f64,
    pub lon: f64,
    pub height: f64,
}

impl Default for GroundPoint {
    fn default() -> Self {
        Self::nan()
    }
}

impl GroundPoint {
    pub fn new(lat: f64, lon: f64, height: f64) -> Self {
        Self { lat, lon, height }
    }

    pub fn nan() -> Self {
        Self::new(f64::NAN, f64::NAN, f64::NAN)
    }

    pub fn has_nan(&self) -> bool {
        self.lat.is_nan() || self.lon.is_nan() || self.height.is_nan()
    }

    pub fn is_lat_lon_nan(&self) -> bool {
        self.lat.is_nan() || self.lon.is_nan()
    }

    pub fn to_ecef(&self) -> Vector3<f64> {
        WGS84.geodetic_to_ecef(self.lat, self.lon, self.height)
    }

    pub fn from_ecef(ecef: &Vector3<f64>) -> Self {
        Self::from_ecef_with(ecef, &WGS84)
    }

    pub fn from_ecef_with(ecef: &Vector3<f64>, ellipsoid: &Ellipsoid) -> Self {
        let (lat, lon, height) = ellipsoid.ecef_to_geodetic(ecef);
        Self { lat, lon, height }
    }

    /// Meters per degree of longitude (`x`) and latitude (`y`) at this point.
    pub fn meters_per_degree(&self) -> Vector2<f64> {
        let h = if self.height.is_finite() {
            self.height
        } else {
            0.0
        };
        WGS84.meters_per_degree(self.lat, h)
    }

    /// Moves the point by a local `(north, east, up)` displacement in meters.
    pub fn offset_neu(&self, neu: &Vector3<f64>) -> GroundPoint {
        let mpd = self.meters_per_degree();
        GroundPoint::new(
            self.lat + neu.x / mpd.y,
            self.lon + neu.y / mpd.x,
            self.height + neu.z,
        )
    }

    /// Local `(north, east, up)` displacement in meters from `self` to `other`.
    pub fn neu_to(&self, other: &GroundPoint) -> Vector3<f64> {
        let mpd = self.meters_per_degree();
        let mut dlon = other.lon - self.lon;
        if dlon > 180.0 {
            dlon -= 360.0;
        } else if dlon < -180.0 {
            dlon += 360.0;
        }
        Vector3::new(
            (other.lat - self.lat) * mpd.y,
            dlon * mpd.x,
            other.height - self.height,
        )
    }

    /// Straight-line ECEF distance in meters.
    pub fn distance_to(&self, other: &GroundPoint) -> f64 {
        (self.to_ecef() - other.to_ecef()).norm()
    }
}

/// Axis-aligned image rectangle in pixel coordinates (inclusive corners).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl ImageRect {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Full-image rectangle `[0, width - 1] x [0, height - 1]`.
    pub fn from_size(width: f64, height: f64) -> Self {
        Self::new(0.0, 0.0, width - 1.0, height - 1.0)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x + 1.0
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y + 1.0
    }

    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(
            0.5 * (self.min_x + self.max_x),
            0.5 * (self.min_y + self.max_y),
        )
    }

    /// Upper-left, upper-right, lower-right, lower-left.
    pub fn corners(&self) -> [Vector2<f64>; 4] {
        [
            Vector2::new(self.min_x, self.min_y),
            Vector2::new(self.max_x, self.min_y),
            Vector2::new(self.max_x, self.max_y),
            Vector2::new(self.min_x, self.max_y),
        ]
    }

    /// Point-in-rectangle test with the rectangle grown by `epsilon` on every side.
    pub fn contains(&self, point: &Vector2<f64>, epsilon: f64) -> bool {
        point.x >= self.min_x - epsilon
            && point.x <= self.max_x + epsilon
            && point.y >= self.min_y - epsilon
            && point.y <= self.max_y + epsilon
    }
}

/// Generate a grid of sample points that are evenly distributed across `rect`.
///
/// # Arguments
///
/// * `rect` - The image region to cover
/// * `n` - The approximate number of points to generate
///
/// # Returns
///
/// A vector of 2D points at the centers of the grid cells
pub fn sample_image_grid(rect: &ImageRect, n: usize) -> Vec<Vector2<f64>> {
    let width = rect.width();
    let height = rect.height();
    if n == 0 || width <= 0.0 || height <= 0.0 {
        return Vec::new();
    }

    // Calculate the number of cells in each dimension
    let num_cells_x = ((n as f64 * (width / height)).sqrt().round() as usize).max(1);
    let num_cells_y = ((n as f64 * (height / width)).sqrt().round() as usize).max(1);

    let cell_width = width / num_cells_x as f64;
    let cell_height = height / num_cells_y as f64;

    let mut points = Vec::with_capacity(num_cells_x * num_cells_y);
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let x = rect.min_x + (j as f64 + 0.5) * cell_width - 0.5;
            let y = rect.min_y + (i as f64 + 0.5) * cell_height - 0.5;
            points.push(Vector2::new(x, y));
        }
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sample_image_grid() {
        let rect = ImageRect::from_size(800.0, 600.0);
        let n = 100;

        let points = sample_image_grid(&rect, n);

        // It might not be exactly n due to rounding
        let expected_count = (n as f64 * 0.8) as usize..=(n as f64 * 1.2) as usize;
        assert!(
            expected_count.contains(&points.len()),
            "Expected around {} points, got {}",
            n,
            points.len()
        );

        for point in &points {
            assert!(
                rect.contains(point, 0.0),
                "Point outside image bounds: {:?}",
                point
            );
        }
    }

    #[test]
    fn test_image_rect_contains_with_epsilon() {
        let rect = ImageRect::from_size(100.0, 50.0);
        assert!(rect.contains(&Vector2::new(99.0, 49.0), 0.0));
        assert!(!rect.contains(&Vector2::new(100.5, 10.0), 0.0));
        assert!(rect.contains(&Vector2::new(100.5, 10.0), 2.0));
        assert!(!rect.contains(&Vector2::new(-2.5, 10.0), 2.0));
    }

    #[test]
    fn test_neu_offset_round_trip() {
        let origin = GroundPoint::new(47.5, 8.25, 420.0);
        let neu = Vector3::new(120.0, -75.0, 12.5);
        let moved = origin.offset_neu(&neu);
        let back = origin.neu_to(&moved);
        assert_relative_eq!(back, neu, epsilon = 1e-9);
        assert_relative_eq!(origin.distance_to(&moved), neu.norm(), epsilon = 0.05);
    }

    #[test]
    fn test_nan_ground_point() {
        let p = GroundPoint::nan();
        assert!(p.has_nan());
        assert!(p.is_lat_lon_nan());
        assert!(!GroundPoint::new(1.0, 2.0, f64::NAN).is_lat_lon_nan());
    }
}
