//! Linear-array (pushbroom) imager.
//!
//! Each image line is exposed at its own time. The platform position and
//! velocity come from an ECEF ephemeris interpolated with Lagrange
//! polynomials, the attitude from linearly interpolated roll/pitch/yaw samples
//! relative to the orbital frame, and each detector has its own along-track and
//! cross-track look angle.
//!
//! There is no closed-form inverse; `world_to_line_sample` uses the generic
//! Newton iteration of [`SensorModel`].

use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::{SensorGeometry, SensorModel, SensorModelError};
use crate::geometry::{EcefRay, GroundPoint};
use crate::keywordlist::{join_key, KeywordList};

const ROLL_OFFSET: usize = 0;
const PITCH_OFFSET: usize = 1;
const YAW_OFFSET: usize = 2;
const ROLL_RATE: usize = 3;
const PITCH_RATE: usize = 4;
const YAW_RATE: usize = 5;
const FOCAL_SCALE: usize = 6;

/// Number of ephemeris samples used by the Lagrange interpolator.
const LAGRANGE_ORDER: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemerisSample {
    /// Seconds.
    pub time: f64,
    /// ECEF meters.
    pub position: Vector3<f64>,
    /// ECEF meters per second.
    pub velocity: Vector3<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttitudeSample {
    pub time: f64,
    /// Degrees.
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Support data of a pushbroom acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushbroomParameters {
    /// Time of line 0, seconds.
    pub first_line_time: f64,
    /// Seconds per line.
    pub line_period: f64,
    pub ephemeris: Vec<EphemerisSample>,
    pub attitude: Vec<AttitudeSample>,
    /// Along-track look angle per detector, degrees.
    pub look_angle_x: Vec<f64>,
    /// Cross-track look angle per detector, degrees.
    pub look_angle_y: Vec<f64>,
}

impl PushbroomParameters {
    pub fn validate(&self) -> Result<(), SensorModelError> {
        if !(self.line_period > 0.0 && self.line_period.is_finite()) {
            return Err(SensorModelError::InvalidParams(
                "Line period must be positive".to_string(),
            ));
        }
        if self.ephemeris.len() < 2 || self.attitude.is_empty() {
            return Err(SensorModelError::InvalidParams(
                "Need at least two ephemeris samples and one attitude sample".to_string(),
            ));
        }
        if self.ephemeris.windows(2).any(|w| w[1].time <= w[0].time)
            || self.attitude.windows(2).any(|w| w[1].time <= w[0].time)
        {
            return Err(SensorModelError::InvalidParams(
                "Ephemeris and attitude samples must be strictly increasing in time".to_string(),
            ));
        }
        if self.look_angle_x.len() != self.look_angle_y.len() || self.look_angle_x.len() < 2 {
            return Err(SensorModelError::InvalidParams(
                "Look angle tables must have the same length (at least 2)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn line_time(&self, line: f64) -> f64 {
        self.first_line_time + line * self.line_period
    }

    /// Lagrange interpolation of position and velocity at `time`.
    pub fn interpolate_ephemeris(&self, time: f64) -> (Vector3<f64>, Vector3<f64>) {
        let n = self.ephemeris.len();
        let order = LAGRANGE_ORDER.min(n);
        let after = self.ephemeris.partition_point(|s| s.time < time);
        let start = after.saturating_sub(order / 2).min(n - order);
        let window = &self.ephemeris[start..start + order];

        let mut position = Vector3::zeros();
        let mut velocity = Vector3::zeros();
        for (j, sj) in window.iter().enumerate() {
            let mut weight = 1.0;
            for (k, sk) in window.iter().enumerate() {
                if k != j {
                    weight *= (time - sk.time) / (sj.time - sk.time);
                }
            }
            position += sj.position * weight;
            velocity += sj.velocity * weight;
        }
        (position, velocity)
    }

    /// Linear interpolation of roll/pitch/yaw (degrees), clamped at the ends.
    pub fn interpolate_attitude(&self, time: f64) -> Vector3<f64> {
        let samples = &self.attitude;
        let as_vec = |s: &AttitudeSample| Vector3::new(s.roll, s.pitch, s.yaw);
        let after = samples.partition_point(|s| s.time < time);
        if after == 0 {
            return as_vec(&samples[0]);
        }
        if after == samples.len() {
            return as_vec(&samples[samples.len() - 1]);
        }
        let (a, b) = (&samples[after - 1], &samples[after]);
        let t = (time - a.time) / (b.time - a.time);
        as_vec(a) * (1.0 - t) + as_vec(b) * t
    }

    /// Look angles (degrees) at a fractional detector index, linear between detectors.
    pub fn look_angles(&self, sample: f64) -> (f64, f64) {
        let n = self.look_angle_x.len();
        let i0 = (sample.floor().max(0.0) as usize).min(n - 2);
        let t = sample - i0 as f64;
        let lerp = |table: &[f64]| table[i0] + (table[i0 + 1] - table[i0]) * t;
        (lerp(&self.look_angle_x), lerp(&self.look_angle_y))
    }
}

/// Orbital reference frame: z toward the Earth center, y normal to the
/// orbit plane, x completing the right-handed triad (roughly along-track).
fn orbital_frame(position: &Vector3<f64>, velocity: &Vector3<f64>) -> Matrix3<f64> {
    let z = -position.normalize();
    let y = z.cross(velocity).normalize();
    let x = y.cross(&z);
    Matrix3::from_columns(&[x, y, z])
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushbroomModel {
    geometry: SensorGeometry,
    parameters: PushbroomParameters,
    // Caches rebuilt by update_model.
    center_time: f64,
    attitude_bias: Vector3<f64>,
    attitude_rate: Vector3<f64>,
    focal_factor: f64,
}

impl PushbroomModel {
    pub const TYPE_NAME: &'static str = "pushbroom";

    pub fn new(
        image_id: &str,
        lines: f64,
        parameters: PushbroomParameters,
        reference_height: f64,
    ) -> Result<Self, SensorModelError> {
        parameters.validate()?;
        let samples = parameters.look_angle_x.len() as f64;
        let geometry = SensorGeometry::new(image_id, samples, lines);
        let mut model = Self::from_parts(geometry, parameters);
        model.init_adjustable_parameters();
        model.update_model();
        model.set_reference_ground_point(reference_height)?;
        Ok(model)
    }

    fn from_parts(geometry: SensorGeometry, parameters: PushbroomParameters) -> Self {
        let center_time = parameters.line_time(geometry.ref_image_point.y);
        Self {
            geometry,
            parameters,
            center_time,
            attitude_bias: Vector3::zeros(),
            attitude_rate: Vector3::zeros(),
            focal_factor: 1.0,
        }
    }

    fn init_adjustable_parameters(&mut self) {
        let store = &mut self.geometry.adjustable_parameters;
        store.add_parameter("roll_offset", "degrees", 0.001);
        store.add_parameter("pitch_offset", "degrees", 0.001);
        store.add_parameter("yaw_offset", "degrees", 0.001);
        store.add_parameter("roll_rate", "degrees/second", 1e-4);
        store.add_parameter("pitch_rate", "degrees/second", 1e-4);
        store.add_parameter("yaw_rate", "degrees/second", 1e-4);
        store.add_parameter("focal_scale", "unitless", 1e-4);
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

    pub fn parameters(&self) -> &PushbroomParameters {
        &self.parameters
    }

    pub fn load_state(kwl: &KeywordList, prefix: &str) -> Result<Self, SensorModelError> {
        let geometry = SensorGeometry::load_state(kwl, prefix)?;
        let ephemeris_count: usize = kwl.get(&join_key(prefix, "number_of_ephemeris_points"))?;
        let mut ephemeris = Vec::with_capacity(ephemeris_count);
        for i in 0..ephemeris_count {
            let values = kwl.get_f64_list(&join_key(prefix, &format!("ephemeris_{i}")))?;
            if values.len() != 7 {
                return Err(SensorModelError::InvalidParams(format!(
                    "ephemeris_{i} needs 7 values"
                )));
            }
            ephemeris.push(EphemerisSample {
                time: values[0],
                position: Vector3::new(values[1], values[2], values[3]),
                velocity: Vector3::new(values[4], values[5], values[6]),
            });
        }
        let attitude_count: usize = kwl.get(&join_key(prefix, "number_of_attitude_points"))?;
        let mut attitude = Vec::with_capacity(attitude_count);
        for i in 0..attitude_count {
            let values = kwl.get_f64_list(&join_key(prefix, &format!("attitude_{i}")))?;
            if values.len() != 4 {
                return Err(SensorModelError::InvalidParams(format!(
                    "attitude_{i} needs 4 values"
                )));
            }
            attitude.push(AttitudeSample {
                time: values[0],
                roll: values[1],
                pitch: values[2],
                yaw: values[3],
            });
        }
        let parameters = PushbroomParameters {
            first_line_time: kwl.get_f64(&join_key(prefix, "first_line_time"))?,
            line_period: kwl.get_f64(&join_key(prefix, "line_period"))?,
            ephemeris,
            attitude,
            look_angle_x: kwl.get_f64_list(&join_key(prefix, "look_angle_x"))?,
            look_angle_y: kwl.get_f64_list(&join_key(prefix, "look_angle_y"))?,
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

impl SensorModel for PushbroomModel {
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
        self.center_time = self.parameters.line_time(self.geometry.ref_image_point.y);
        self.attitude_bias = Vector3::new(
            store.compute_offset(ROLL_OFFSET),
            store.compute_offset(PITCH_OFFSET),
            store.compute_offset(YAW_OFFSET),
        );
        self.attitude_rate = Vector3::new(
            store.compute_offset(ROLL_RATE),
            store.compute_offset(PITCH_RATE),
            store.compute_offset(YAW_RATE),
        );
        self.focal_factor = 1.0 + store.compute_offset(FOCAL_SCALE);
        self.refresh_footprint();
    }

    fn imaging_ray(&self, image_point: &Vector2<f64>) -> Option<EcefRay> {
        if image_point.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let time = self.parameters.line_time(image_point.y);
        let (position, velocity) = self.parameters.interpolate_ephemeris(time);
        let angles = self.parameters.interpolate_attitude(time)
            + self.attitude_bias
            + self.attitude_rate * (time - self.center_time);
        let attitude = Rotation3::from_euler_angles(
            angles.x.to_radians(),
            angles.y.to_radians(),
            angles.z.to_radians(),
        );
        let (psi_x, psi_y) = self.parameters.look_angles(image_point.x);
        let look = Vector3::new(
            psi_x.to_radians().tan() / self.focal_factor,
            psi_y.to_radians().tan() / self.focal_factor,
            1.0,
        );
        let direction = orbital_frame(&position, &velocity) * attitude.matrix() * look;
        Some(EcefRay::new(position, direction))
    }

    fn line_sample_height_to_world(&self, image_point: &Vector2<f64>, height: f64) -> GroundPoint {
        self.imaging_ray(image_point)
            .and_then(|ray| ray.intersect_ground(height, &self.geometry.ellipsoid))
            .unwrap_or_else(GroundPoint::nan)
    }

    fn save_model_state(&self, kwl: &mut KeywordList, prefix: &str) {
        let p = &self.parameters;
        kwl.save(&join_key(prefix, "first_line_time"), p.first_line_time);
        kwl.save(&join_key(prefix, "line_period"), p.line_period);
        kwl.save(
            &join_key(prefix, "number_of_ephemeris_points"),
            p.ephemeris.len(),
        );
        for (i, s) in p.ephemeris.iter().enumerate() {
            kwl.save_f64_list(
                &join_key(prefix, &format!("ephemeris_{i}")),
                &[
                    s.time,
                    s.position.x,
                    s.position.y,
                    s.position.z,
                    s.velocity.x,
                    s.velocity.y,
                    s.velocity.z,
                ],
            );
        }
        kwl.save(
            &join_key(prefix, "number_of_attitude_points"),
            p.attitude.len(),
        );
        for (i, s) in p.attitude.iter().enumerate() {
            kwl.save_f64_list(
                &join_key(prefix, &format!("attitude_{i}")),
                &[s.time, s.roll, s.pitch, s.yaw],
            );
        }
        kwl.save_f64_list(&join_key(prefix, "look_angle_x"), &p.look_angle_x);
        kwl.save_f64_list(&join_key(prefix, "look_angle_y"), &p.look_angle_y);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::WGS84;
    use approx::assert_relative_eq;

    const ORBIT_HEIGHT: f64 = 700_000.0;
    const LAT_RATE: f64 = 0.06;

    fn satellite_position(time: f64) -> Vector3<f64> {
        WGS84.geodetic_to_ecef(10.0 + LAT_RATE * time, 20.0, ORBIT_HEIGHT)
    }

    pub(crate) fn sample_parameters() -> PushbroomParameters {
        let ephemeris = (-5..=6)
            .map(|i| {
                let t = i as f64;
                let h = 1e-3;
                EphemerisSample {
                    time: t,
                    position: satellite_position(t),
                    velocity: (satellite_position(t + h) - satellite_position(t - h)) / (2.0 * h),
                }
            })
            .collect();
        let attitude = (-5..=6)
            .map(|i| {
                let t = i as f64;
                AttitudeSample {
                    time: t,
                    roll: 0.1 + 0.002 * t,
                    pitch: -0.05,
                    yaw: 0.2 - 0.001 * t,
                }
            })
            .collect();
        let detectors = 1000;
        let look_angle_y = (0..detectors)
            .map(|i| -0.3 + 0.6 * i as f64 / (detectors - 1) as f64)
            .collect();
        PushbroomParameters {
            first_line_time: 0.0,
            line_period: 1e-3,
            ephemeris,
            attitude,
            look_angle_x: vec![0.01; detectors],
            look_angle_y,
        }
    }

    pub(crate) fn sample_pushbroom() -> PushbroomModel {
        PushbroomModel::new("pushbroom_sample", 1000.0, sample_parameters(), 250.0).unwrap()
    }

    #[test]
    fn test_lagrange_reproduces_samples() {
        let parameters = sample_parameters();
        for s in &parameters.ephemeris {
            let (p, v) = parameters.interpolate_ephemeris(s.time);
            assert_relative_eq!(p, s.position, epsilon = 1e-6);
            assert_relative_eq!(v, s.velocity, epsilon = 1e-6);
        }
        let (p, _) = parameters.interpolate_ephemeris(0.37);
        assert_relative_eq!(p, satellite_position(0.37), epsilon = 1e-3);
    }

    #[test]
    fn test_attitude_interpolation() {
        let parameters = sample_parameters();
        let a = parameters.interpolate_attitude(0.5);
        assert_relative_eq!(a.x, 0.101, epsilon = 1e-12);
        let clamped = parameters.interpolate_attitude(100.0);
        assert_relative_eq!(clamped.x, 0.1 + 0.002 * 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pushbroom_round_trip() {
        let model = sample_pushbroom();
        for &(s, l) in &[(0.0, 0.0), (499.5, 499.5), (999.0, 3.0), (123.25, 876.5)] {
            for h in [0.0, 250.0, 1800.0] {
                let p = Vector2::new(s, l);
                let g = model.line_sample_height_to_world(&p, h);
                assert!(!g.has_nan());
                let back = model.world_to_line_sample(&g);
                assert_relative_eq!(back, p, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_pushbroom_lines_advance_along_track() {
        let model = sample_pushbroom();
        let first = model.line_sample_height_to_world(&Vector2::new(500.0, 0.0), 0.0);
        let last = model.line_sample_height_to_world(&Vector2::new(500.0, 999.0), 0.0);
        // The satellite moves north, so later lines image further north.
        assert!(last.lat > first.lat);
        let gsd = model.geometry().gsd;
        assert!(gsd.x > 5.0 && gsd.x < 10.0, "{gsd:?}");
        assert!(gsd.y > 5.0 && gsd.y < 10.0, "{gsd:?}");
    }

    #[test]
    fn test_pushbroom_roll_offset_moves_cross_track() {
        let mut model = sample_pushbroom();
        let g = model.line_sample_height_to_world(&Vector2::new(400.0, 600.0), 250.0);
        let d = model.forward_deriv(ROLL_OFFSET, &g, 1e-2).unwrap();
        // 0.001 deg of roll at 700 km is ~12 m, i.e. well over one pixel cross-track.
        assert!(d.x.abs() > 1.0, "{d:?}");
        assert!(d.y.abs() < d.x.abs());

        model.set_adjustable_parameter(ROLL_OFFSET, 1.0).unwrap();
        let moved = model.world_to_line_sample(&g);
        assert!((moved.x - 400.0).abs() > 1.0);
    }

    #[test]
    fn test_pushbroom_rejects_unsorted_ephemeris() {
        let mut parameters = sample_parameters();
        parameters.ephemeris.swap(0, 1);
        assert!(PushbroomModel::new("bad", 1000.0, parameters, 0.0).is_err());
    }
}
