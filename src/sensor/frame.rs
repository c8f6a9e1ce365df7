//! Frame (aerial) camera: a single perspective center for the whole image.
//!
//! The platform carries a geodetic position and a roll/pitch/heading attitude
//! relative to the local north-east-down frame. The camera looks along the
//! body down axis with image samples increasing to the east and lines to the
//! south at zero attitude.

use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::{SensorGeometry, SensorModel, SensorModelError};
use crate::geometry::{EcefRay, GroundPoint};
use crate::keywordlist::{join_key, KeywordList};

const ROLL_OFFSET: usize = 0;
const PITCH_OFFSET: usize = 1;
const HEADING_OFFSET: usize = 2;
const FOCAL_OFFSET: usize = 3;
const NORTH_OFFSET: usize = 4;
const EAST_OFFSET: usize = 5;
const UP_OFFSET: usize = 6;

/// Camera axes expressed in the body (NED) frame: x east, y south, z down.
fn camera_to_body() -> Matrix3<f64> {
    Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0)
}

/// Exterior and interior orientation of a frame camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameParameters {
    pub platform: GroundPoint,
    /// Degrees.
    pub roll: f64,
    pub pitch: f64,
    pub heading: f64,
    /// Millimeters.
    pub focal_length: f64,
    /// Millimeters per pixel.
    pub pixel_size: f64,
    /// `(sample, line)` in pixels.
    pub principal_point: Vector2<f64>,
}

impl FrameParameters {
    pub fn validate(&self) -> Result<(), SensorModelError> {
        if !(self.focal_length > 0.0 && self.focal_length.is_finite()) {
            return Err(SensorModelError::InvalidParams(
                "Focal length must be positive".to_string(),
            ));
        }
        if !(self.pixel_size > 0.0 && self.pixel_size.is_finite()) {
            return Err(SensorModelError::InvalidParams(
                "Pixel size must be positive".to_string(),
            ));
        }
        if self.platform.has_nan() {
            return Err(SensorModelError::InvalidParams(
                "Platform position must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameModel {
    geometry: SensorGeometry,
    parameters: FrameParameters,
    // Caches rebuilt by update_model.
    ecef_position: Vector3<f64>,
    ecef_from_camera: Matrix3<f64>,
    adjusted_focal: f64,
}

impl FrameModel {
    pub const TYPE_NAME: &'static str = "frame";

    pub fn new(
        image_id: &str,
        samples: f64,
        lines: f64,
        parameters: FrameParameters,
        reference_height: f64,
    ) -> Result<Self, SensorModelError> {
        parameters.validate()?;
        let geometry = SensorGeometry::new(image_id, samples, lines);
        let mut model = Self::from_parts(geometry, parameters);
        model.init_adjustable_parameters();
        model.update_model();
        model.set_reference_ground_point(reference_height)?;
        Ok(model)
    }

    fn from_parts(geometry: SensorGeometry, parameters: FrameParameters) -> Self {
        Self {
            geometry,
            parameters,
            ecef_position: Vector3::zeros(),
            ecef_from_camera: Matrix3::identity(),
            adjusted_focal: 0.0,
        }
    }

    fn init_adjustable_parameters(&mut self) {
        let store = &mut self.geometry.adjustable_parameters;
        store.add_parameter("roll_offset", "degrees", 0.05);
        store.add_parameter("pitch_offset", "degrees", 0.05);
        store.add_parameter("heading_offset", "degrees", 0.05);
        store.add_parameter("focal_offset", "millimeters", 0.1);
        store.add_parameter("north_offset", "meters", 5.0);
        store.add_parameter("east_offset", "meters", 5.0);
        store.add_parameter("up_offset", "meters", 5.0);
    }

    fn set_reference_ground_point(&mut self, height: f64) -> Result<(), SensorModelError> {
        let reference = self.geometry.ref_image_point;
        let ground = self.line_sample_height_to_world(&reference, height);
        if ground.is_lat_lon_nan() {
            return Err(SensorModelError::RayMissesEllipsoid);
        }
        self.geometry.ref_ground_point = ground;
        self.update_model();
        Ok(())
    }

    pub fn parameters(&self) -> &FrameParameters {
        &self.parameters
    }

    /// Platform position including the position offsets.
    pub fn adjusted_platform(&self) -> GroundPoint {
        GroundPoint::from_ecef_with(&self.ecef_position, &self.geometry.ellipsoid)
    }

    pub fn load_state(kwl: &KeywordList, prefix: &str) -> Result<Self, SensorModelError> {
        let geometry = SensorGeometry::load_state(kwl, prefix)?;
        let platform = kwl.get_f64_list(&join_key(prefix, "platform_lat_lon_hgt"))?;
        let principal = kwl.get_f64_list(&join_key(prefix, "principal_point"))?;
        if platform.len() != 3 || principal.len() != 2 {
            return Err(SensorModelError::InvalidParams(
                "platform needs 3 values and principal_point 2".to_string(),
            ));
        }
        let parameters = FrameParameters {
            platform: GroundPoint::new(platform[0], platform[1], platform[2]),
            roll: kwl.get_f64(&join_key(prefix, "roll"))?,
            pitch: kwl.get_f64(&join_key(prefix, "pitch"))?,
            heading: kwl.get_f64(&join_key(prefix, "heading"))?,
            focal_length: kwl.get_f64(&join_key(prefix, "focal_length"))?,
            pixel_size: kwl.get_f64(&join_key(prefix, "pixel_size"))?,
            principal_point: Vector2::new(principal[0], principal[1]),
        };
        parameters.validate()?;
        let has_parameters = geometry.adjustable_parameters.number_of_parameters() > 0;
        let has_reference = !geometry.ref_ground_point.is_lat_lon_nan();
        let mut model = Self::from_parts(geometry, parameters);
        if !has_parameters {
            model.init_adjustable_parameters();
        }
        model.update_model();
        if !has_reference {
            model.set_reference_ground_point(0.0)?;
        }
        Ok(model)
    }
}

impl SensorModel for FrameModel {
    fn geometry(&self) -> &SensorGeometry {
        &self.geometry
    }

    fn geometry_mut(&mut self) -> &mut SensorGeometry {
        &mut self.geometry
    }

    fn model_type(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn update_model(&mut self) {
        let store = &self.geometry.adjustable_parameters;
        let p = &self.parameters;
        let ellipsoid = &self.geometry.ellipsoid;

        let shift = Vector3::new(
            store.compute_offset(NORTH_OFFSET),
            store.compute_offset(EAST_OFFSET),
            store.compute_offset(UP_OFFSET),
        );
        let platform = p.platform.offset_neu(&shift);
        self.ecef_position =
            ellipsoid.geodetic_to_ecef(platform.lat, platform.lon, platform.height);

        let roll = (p.roll + store.compute_offset(ROLL_OFFSET)).to_radians();
        let pitch = (p.pitch + store.compute_offset(PITCH_OFFSET)).to_radians();
        let heading = (p.heading + store.compute_offset(HEADING_OFFSET)).to_radians();
        let attitude = Rotation3::from_euler_angles(roll, pitch, heading);
        self.ecef_from_camera = ellipsoid.ned_to_ecef(platform.lat, platform.lon)
            * attitude.matrix()
            * camera_to_body();
        self.adjusted_focal = p.focal_length + store.compute_offset(FOCAL_OFFSET);

        self.refresh_footprint();
    }

    fn imaging_ray(&self, image_point: &Vector2<f64>) -> Option<EcefRay> {
        if image_point.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let p = &self.parameters;
        let camera = Vector3::new(
            (image_point.x - p.principal_point.x) * p.pixel_size,
            (image_point.y - p.principal_point.y) * p.pixel_size,
            self.adjusted_focal,
        );
        Some(EcefRay::new(
            self.ecef_position,
            self.ecef_from_camera * camera,
        ))
    }

    fn line_sample_height_to_world(&self, image_point: &Vector2<f64>, height: f64) -> GroundPoint {
        self.imaging_ray(image_point)
            .and_then(|ray| ray.intersect_ground(height, &self.geometry.ellipsoid))
            .unwrap_or_else(GroundPoint::nan)
    }

    /// Collinearity equations.
    fn world_to_line_sample(&self, ground_point: &GroundPoint) -> Vector2<f64> {
        if ground_point.is_lat_lon_nan() {
            return Vector2::new(f64::NAN, f64::NAN);
        }
        let height = if ground_point.height.is_finite() {
            ground_point.height
        } else {
            self.geometry.reference_height()
        };
        let ecef = self
            .geometry
            .ellipsoid
            .geodetic_to_ecef(ground_point.lat, ground_point.lon, height);
        let v = self.ecef_from_camera.transpose() * (ecef - self.ecef_position);
        if v.z <= 0.0 {
            return Vector2::new(f64::NAN, f64::NAN);
        }
        let p = &self.parameters;
        let scale = self.adjusted_focal / (v.z * p.pixel_size);
        Vector2::new(
            p.principal_point.x + v.x * scale,
            p.principal_point.y + v.y * scale,
        )
    }

    fn save_model_state(&self, kwl: &mut KeywordList, prefix: &str) {
        let p = &self.parameters;
        kwl.save_f64_list(
            &join_key(prefix, "platform_lat_lon_hgt"),
            &[p.platform.lat, p.platform.lon, p.platform.height],
        );
        kwl.save(&join_key(prefix, "roll"), p.roll);
        kwl.save(&join_key(prefix, "pitch"), p.pitch);
        kwl.save(&join_key(prefix, "heading"), p.heading);
        kwl.save(&join_key(prefix, "focal_length"), p.focal_length);
        kwl.save(&join_key(prefix, "pixel_size"), p.pixel_size);
        kwl.save_f64_list(
            &join_key(prefix, "principal_point"),
            &[p.principal_point.x, p.principal_point.y],
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::ConstantElevation;
    use approx::assert_relative_eq;

    pub(crate) fn sample_parameters() -> FrameParameters {
        FrameParameters {
            platform: GroundPoint::new(35.0, -110.0, 3000.0),
            roll: 0.5,
            pitch: -0.3,
            heading: 30.0,
            focal_length: 100.0,
            pixel_size: 0.01,
            principal_point: Vector2::new(999.5, 999.5),
        }
    }

    pub(crate) fn sample_frame() -> FrameModel {
        FrameModel::new("frame_sample", 2000.0, 2000.0, sample_parameters(), 1500.0).unwrap()
    }

    #[test]
    fn test_frame_round_trip() {
        let model = sample_frame();
        for &(s, l) in &[(0.0, 0.0), (999.5, 999.5), (1999.0, 10.0), (420.25, 1777.75)] {
            for h in [1200.0, 1500.0, 1800.0] {
                let p = Vector2::new(s, l);
                let g = model.line_sample_height_to_world(&p, h);
                assert_relative_eq!(g.height, h, epsilon = 1e-3);
                let back = model.world_to_line_sample(&g);
                assert_relative_eq!(back, p, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_frame_nadir_geometry() {
        let mut parameters = sample_parameters();
        parameters.roll = 0.0;
        parameters.pitch = 0.0;
        parameters.heading = 0.0;
        let model = FrameModel::new("nadir", 2000.0, 2000.0, parameters, 0.0).unwrap();
        let g = model.line_sample_height_to_world(&Vector2::new(999.5, 999.5), 0.0);
        assert_relative_eq!(g.lat, 35.0, epsilon = 1e-9);
        assert_relative_eq!(g.lon, -110.0, epsilon = 1e-9);

        // Samples increase east, lines increase south.
        let east = model.line_sample_height_to_world(&Vector2::new(1500.0, 999.5), 0.0);
        let south = model.line_sample_height_to_world(&Vector2::new(999.5, 1500.0), 0.0);
        assert!(east.lon > g.lon);
        assert!(south.lat < g.lat);
        // 3000 m * 0.01 mm / 100 mm = 0.3 m per pixel.
        assert_relative_eq!(model.geometry().mean_gsd, 0.3, epsilon = 1e-3);
    }

    #[test]
    fn test_frame_position_offset_moves_footprint() {
        let mut model = sample_frame();
        let p = Vector2::new(999.5, 999.5);
        let before = model.line_sample_height_to_world(&p, 1500.0);
        model.set_adjustable_parameter(NORTH_OFFSET, 1.0).unwrap();
        let after = model.line_sample_height_to_world(&p, 1500.0);
        let moved = before.neu_to(&after);
        assert_relative_eq!(moved.x, 5.0, epsilon = 1e-2);
        assert_relative_eq!(moved.y, 0.0, epsilon = 1e-2);
    }

    #[test]
    fn test_frame_forward_deriv_matches_pixel_motion() {
        let model = sample_frame();
        let g = model.line_sample_height_to_world(&Vector2::new(700.0, 1300.0), 1500.0);
        let d_focal = model.forward_deriv(FOCAL_OFFSET, &g, 1e-4).unwrap();
        // A longer focal length pushes points away from the principal point.
        let ip = model.world_to_line_sample(&g);
        let radial = ip - model.parameters().principal_point;
        assert!(d_focal.dot(&radial) > 0.0);

        let d_east = model.inverse_deriv(EAST_OFFSET, &ip, 1500.0, 1e-2).unwrap();
        assert_relative_eq!(d_east, Vector3::new(0.0, 5.0, 0.0), epsilon = 1e-2);
    }

    #[test]
    fn test_frame_coordinate_deriv() {
        let model = FrameModel::new(
            "nadir",
            2000.0,
            2000.0,
            FrameParameters {
                roll: 0.0,
                pitch: 0.0,
                heading: 0.0,
                ..sample_parameters()
            },
            0.0,
        )
        .unwrap();
        let g = model.line_sample_height_to_world(&Vector2::new(999.5, 999.5), 0.0);
        let d = model.coordinate_forward_deriv(&g, 1.0);
        // One meter north is -1/0.3 lines, one meter east is +1/0.3 samples.
        assert_relative_eq!(d[(1, 0)], -1.0 / 0.3, epsilon = 1e-2);
        assert_relative_eq!(d[(0, 1)], 1.0 / 0.3, epsilon = 1e-2);
        assert_relative_eq!(d[(0, 2)], 0.0, epsilon = 1e-2);
    }

    #[test]
    fn test_frame_terrain_projection() {
        let model = sample_frame();
        let p = Vector2::new(100.0, 1900.0);
        let g = model.line_sample_to_world(&p, &ConstantElevation::new(1500.0));
        assert_relative_eq!(g.height, 1500.0, epsilon = 1e-3);
        assert_relative_eq!(model.world_to_line_sample(&g), p, epsilon = 1e-3);
    }
}
