//! Rational polynomial coefficient (RPC00B) sensor model.
//!
//! Normalized image coordinates are ratios of 20-term cubic polynomials in the
//! normalized longitude `L`, latitude `P` and height `H`. Term order:
//!
//! `1 L P H LP LH PH LL PP HH PLH LLL LPP LHH LLP PPP PHH LLH PPH HHH`
//!
//! The adjustable parameters shift and scale the result in image space and
//! rotate it about the image offset, so their partials are analytic.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use super::{SensorGeometry, SensorModel, SensorModelError};
use crate::geometry::{EcefRay, GroundPoint};
use crate::keywordlist::{join_key, KeywordList};

pub const NUM_TERMS: usize = 20;

const INTRACK_OFFSET: usize = 0;
const CROSSTRACK_OFFSET: usize = 1;
const INTRACK_SCALE: usize = 2;
const CROSSTRACK_SCALE: usize = 3;
const MAP_ROTATION: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCoefficients {
    pub line_offset: f64,
    pub sample_offset: f64,
    pub lat_offset: f64,
    pub lon_offset: f64,
    pub height_offset: f64,
    pub line_scale: f64,
    pub sample_scale: f64,
    pub lat_scale: f64,
    pub lon_scale: f64,
    pub height_scale: f64,
    pub line_num: [f64; NUM_TERMS],
    pub line_den: [f64; NUM_TERMS],
    pub samp_num: [f64; NUM_TERMS],
    pub samp_den: [f64; NUM_TERMS],
}

impl RpcCoefficients {
    pub fn validate(&self) -> Result<(), SensorModelError> {
        let scales = [
            self.line_scale,
            self.sample_scale,
            self.lat_scale,
            self.lon_scale,
            self.height_scale,
        ];
        if scales.iter().any(|s| !s.is_finite() || *s == 0.0) {
            return Err(SensorModelError::InvalidParams(
                "RPC scale factors must be finite and non-zero".to_string(),
            ));
        }
        let mut all = self
            .line_num
            .iter()
            .chain(&self.line_den)
            .chain(&self.samp_num)
            .chain(&self.samp_den);
        if all.any(|c| !c.is_finite()) {
            return Err(SensorModelError::InvalidParams(
                "RPC coefficients must be finite".to_string(),
            ));
        }
        if self.line_den[0] == 0.0 || self.samp_den[0] == 0.0 {
            return Err(SensorModelError::InvalidParams(
                "RPC denominators need a non-zero constant term".to_string(),
            ));
        }
        Ok(())
    }

    pub fn normalize_ground(&self, ground_point: &GroundPoint) -> (f64, f64, f64) {
        let height = if ground_point.height.is_finite() {
            ground_point.height
        } else {
            self.height_offset
        };
        (
            (ground_point.lon - self.lon_offset) / self.lon_scale,
            (ground_point.lat - self.lat_offset) / self.lat_scale,
            (height - self.height_offset) / self.height_scale,
        )
    }
}

/// The 20 cubic terms at normalized `(l, p, h)`.
pub fn terms(l: f64, p: f64, h: f64) -> [f64; NUM_TERMS] {
    [
        1.0,
        l,
        p,
        h,
        l * p,
        l * h,
        p * h,
        l * l,
        p * p,
        h * h,
        p * l * h,
        l * l * l,
        l * p * p,
        l * h * h,
        l * l * p,
        p * p * p,
        p * h * h,
        l * l * h,
        p * p * h,
        h * h * h,
    ]
}

fn terms_dl(l: f64, p: f64, h: f64) -> [f64; NUM_TERMS] {
    [
        0.0,
        1.0,
        0.0,
        0.0,
        p,
        h,
        0.0,
        2.0 * l,
        0.0,
        0.0,
        p * h,
        3.0 * l * l,
        p * p,
        h * h,
        2.0 * l * p,
        0.0,
        0.0,
        2.0 * l * h,
        0.0,
        0.0,
    ]
}

fn terms_dp(l: f64, p: f64, h: f64) -> [f64; NUM_TERMS] {
    [
        0.0,
        0.0,
        1.0,
        0.0,
        l,
        0.0,
        h,
        0.0,
        2.0 * p,
        0.0,
        l * h,
        0.0,
        2.0 * l * p,
        0.0,
        l * l,
        3.0 * p * p,
        h * h,
        0.0,
        2.0 * p * h,
        0.0,
    ]
}

fn dot(coeffs: &[f64; NUM_TERMS], t: &[f64; NUM_TERMS]) -> f64 {
    coeffs.iter().zip(t.iter()).map(|(c, x)| c * x).sum()
}

/// Value of `num / den` and its partials along `l` and `p`.
fn ratio_with_partials(
    num: &[f64; NUM_TERMS],
    den: &[f64; NUM_TERMS],
    t: &[f64; NUM_TERMS],
    dl: &[f64; NUM_TERMS],
    dp: &[f64; NUM_TERMS],
) -> (f64, f64, f64) {
    let n = dot(num, t);
    let d = dot(den, t);
    let d2 = d * d;
    let value = n / d;
    let by_l = (dot(num, dl) * d - n * dot(den, dl)) / d2;
    let by_p = (dot(num, dp) * d - n * dot(den, dp)) / d2;
    (value, by_l, by_p)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcModel {
    geometry: SensorGeometry,
    coefficients: RpcCoefficients,
    intrack_offset: f64,
    crosstrack_offset: f64,
    intrack_scale: f64,
    crosstrack_scale: f64,
    cos_map_rot: f64,
    sin_map_rot: f64,
}

impl RpcModel {
    pub const TYPE_NAME: &'static str = "rpc";

    pub fn new(
        image_id: &str,
        samples: f64,
        lines: f64,
        coefficients: RpcCoefficients,
    ) -> Result<Self, SensorModelError> {
        coefficients.validate()?;
        let mut geometry = SensorGeometry::new(image_id, samples, lines);
        geometry.ref_image_point = Vector2::new(coefficients.sample_offset, coefficients.line_offset);
        geometry.ref_ground_point = GroundPoint::new(
            coefficients.lat_offset,
            coefficients.lon_offset,
            coefficients.height_offset,
        );
        let mut model = Self::from_parts(geometry, coefficients);
        model.init_adjustable_parameters();
        model.update_model();
        Ok(model)
    }

    fn from_parts(geometry: SensorGeometry, coefficients: RpcCoefficients) -> Self {
        Self {
            geometry,
            coefficients,
            intrack_offset: 0.0,
            crosstrack_offset: 0.0,
            intrack_scale: 0.0,
            crosstrack_scale: 0.0,
            cos_map_rot: 1.0,
            sin_map_rot: 0.0,
        }
    }

    fn init_adjustable_parameters(&mut self) {
        let store = &mut self.geometry.adjustable_parameters;
        store.add_parameter("intrack_offset", "pixel", 50.0);
        store.add_parameter("crosstrack_offset", "pixel", 50.0);
        store.add_parameter("intrack_scale", "pixel", 50.0);
        store.add_parameter("crosstrack_scale", "pixel", 50.0);
        store.add_parameter("map_rotation", "degrees", 0.1);
    }

    pub fn coefficients(&self) -> &RpcCoefficients {
        &self.coefficients
    }

    /// Unadjusted normalized `(u, v)` = (sample, line) polynomial ratios.
    fn normalized_image(&self, l: f64, p: f64, h: f64) -> (f64, f64) {
        let c = &self.coefficients;
        let t = terms(l, p, h);
        (
            dot(&c.samp_num, &t) / dot(&c.samp_den, &t),
            dot(&c.line_num, &t) / dot(&c.line_den, &t),
        )
    }

    fn adjusted_scales(&self) -> (f64, f64) {
        (
            self.coefficients.sample_scale + self.crosstrack_scale,
            self.coefficients.line_scale + self.intrack_scale,
        )
    }

    /// Rotated normalized coordinates `(un, vn)` at a ground point.
    fn rotated_normalized(&self, ground_point: &GroundPoint) -> (f64, f64, f64, f64) {
        let (l, p, h) = self.coefficients.normalize_ground(ground_point);
        let (pu, pv) = self.normalized_image(l, p, h);
        let un = self.cos_map_rot * pu - self.sin_map_rot * pv;
        let vn = self.sin_map_rot * pu + self.cos_map_rot * pv;
        (un, vn, pu, pv)
    }

    pub fn load_state(kwl: &KeywordList, prefix: &str) -> Result<Self, SensorModelError> {
        let mut geometry = SensorGeometry::load_state(kwl, prefix)?;
        let get = |name: &str| kwl.get_f64(&join_key(prefix, name));
        let coeffs = |name: &str| -> Result<[f64; NUM_TERMS], SensorModelError> {
            let values = kwl.get_f64_list(&join_key(prefix, name))?;
            values.try_into().map_err(|_| {
                SensorModelError::InvalidParams(format!("{name} needs {NUM_TERMS} values"))
            })
        };
        let coefficients = RpcCoefficients {
            line_offset: get("line_off")?,
            sample_offset: get("samp_off")?,
            lat_offset: get("lat_off")?,
            lon_offset: get("long_off")?,
            height_offset: get("height_off")?,
            line_scale: get("line_scale")?,
            sample_scale: get("samp_scale")?,
            lat_scale: get("lat_scale")?,
            lon_scale: get("long_scale")?,
            height_scale: get("height_scale")?,
            line_num: coeffs("line_num_coeff")?,
            line_den: coeffs("line_den_coeff")?,
            samp_num: coeffs("samp_num_coeff")?,
            samp_den: coeffs("samp_den_coeff")?,
        };
        coefficients.validate()?;
        if !kwl.contains(&join_key(prefix, "ref_point_lat_lon_hgt")) {
            geometry.ref_image_point =
                Vector2::new(coefficients.sample_offset, coefficients.line_offset);
            geometry.ref_ground_point = GroundPoint::new(
                coefficients.lat_offset,
                coefficients.lon_offset,
                coefficients.height_offset,
            );
        }
        let has_parameters = geometry.adjustable_parameters.number_of_parameters() > 0;
        let mut model = Self::from_parts(geometry, coefficients);
        if !has_parameters {
            model.init_adjustable_parameters();
        }
        model.update_model();
        Ok(model)
    }
}

impl SensorModel for RpcModel {
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
        self.intrack_offset = store.compute_offset(INTRACK_OFFSET);
        self.crosstrack_offset = store.compute_offset(CROSSTRACK_OFFSET);
        self.intrack_scale = store.compute_offset(INTRACK_SCALE);
        self.crosstrack_scale = store.compute_offset(CROSSTRACK_SCALE);
        let rotation = store.compute_offset(MAP_ROTATION).to_radians();
        self.sin_map_rot = rotation.sin();
        self.cos_map_rot = rotation.cos();
        self.refresh_footprint();
    }

    /// Closed-form evaluation of the rational polynomials.
    fn world_to_line_sample(&self, ground_point: &GroundPoint) -> Vector2<f64> {
        if ground_point.is_lat_lon_nan() {
            return Vector2::new(f64::NAN, f64::NAN);
        }
        let c = &self.coefficients;
        let (un, vn, _, _) = self.rotated_normalized(ground_point);
        let (sample_scale, line_scale) = self.adjusted_scales();
        Vector2::new(
            un * sample_scale + c.sample_offset + self.crosstrack_offset,
            vn * line_scale + c.line_offset + self.intrack_offset,
        )
    }

    /// Newton iteration in normalized ground space with analytic polynomial partials.
    fn line_sample_height_to_world(&self, image_point: &Vector2<f64>, height: f64) -> GroundPoint {
        if image_point.iter().any(|v| !v.is_finite()) || !height.is_finite() {
            return GroundPoint::nan();
        }
        let c = &self.coefficients;
        let (sample_scale, line_scale) = self.adjusted_scales();
        let u = (image_point.x - c.sample_offset - self.crosstrack_offset) / sample_scale;
        let v = (image_point.y - c.line_offset - self.intrack_offset) / line_scale;
        // Undo the map rotation to get the polynomial targets.
        let target_u = self.cos_map_rot * u + self.sin_map_rot * v;
        let target_v = -self.sin_map_rot * u + self.cos_map_rot * v;

        let settings = &self.geometry.iteration;
        let tolerance = settings.pixel_tolerance / sample_scale.abs().max(line_scale.abs());
        let h = (height - c.height_offset) / c.height_scale;
        let (mut l, mut p) = (0.0, 0.0);
        let mut converged = false;
        for _ in 0..settings.max_iterations.max(1) {
            let t = terms(l, p, h);
            let dl = terms_dl(l, p, h);
            let dp = terms_dp(l, p, h);
            let (pu, du_dl, du_dp) = ratio_with_partials(&c.samp_num, &c.samp_den, &t, &dl, &dp);
            let (pv, dv_dl, dv_dp) = ratio_with_partials(&c.line_num, &c.line_den, &t, &dl, &dp);
            let du = target_u - pu;
            let dv = target_v - pv;
            if du.abs() < tolerance && dv.abs() < tolerance {
                converged = true;
                break;
            }
            let w = du_dp * dv_dl - du_dl * dv_dp;
            if w.abs() < f64::MIN_POSITIVE || !w.is_finite() {
                break;
            }
            let dp_step = (dv_dl * du - du_dl * dv) / w;
            let dl_step = (du_dp * dv - dv_dp * du) / w;
            p += dp_step;
            l += dl_step;
        }
        if !converged {
            return GroundPoint::nan();
        }
        GroundPoint::new(
            p * c.lat_scale + c.lat_offset,
            l * c.lon_scale + c.lon_offset,
            height,
        )
    }

    /// Ray from the top to the bottom of the RPC height range.
    fn imaging_ray(&self, image_point: &Vector2<f64>) -> Option<EcefRay> {
        let c = &self.coefficients;
        let top = self.line_sample_height_to_world(image_point, c.height_offset + c.height_scale);
        let bottom =
            self.line_sample_height_to_world(image_point, c.height_offset - c.height_scale);
        if top.is_lat_lon_nan() || bottom.is_lat_lon_nan() {
            return None;
        }
        let ellipsoid = &self.geometry.ellipsoid;
        let from = ellipsoid.geodetic_to_ecef(top.lat, top.lon, top.height);
        let to = ellipsoid.geodetic_to_ecef(bottom.lat, bottom.lon, bottom.height);
        Some(EcefRay::through(from, to))
    }

    fn analytic_forward_deriv(&self, index: usize, ground_point: &GroundPoint) -> Option<Vector2<f64>> {
        if ground_point.is_lat_lon_nan() {
            return None;
        }
        let store = &self.geometry.adjustable_parameters;
        let sigma = store.sigma(index).ok()?;
        let (un, vn, pu, pv) = self.rotated_normalized(ground_point);
        let (sample_scale, line_scale) = self.adjusted_scales();
        let deriv = match index {
            INTRACK_OFFSET => Vector2::new(0.0, sigma),
            CROSSTRACK_OFFSET => Vector2::new(sigma, 0.0),
            INTRACK_SCALE => Vector2::new(0.0, vn * sigma),
            CROSSTRACK_SCALE => Vector2::new(un * sigma, 0.0),
            MAP_ROTATION => {
                let dtheta = sigma.to_radians();
                let dun = -self.sin_map_rot * pu - self.cos_map_rot * pv;
                let dvn = self.cos_map_rot * pu - self.sin_map_rot * pv;
                Vector2::new(dun * sample_scale * dtheta, dvn * line_scale * dtheta)
            }
            _ => return None,
        };
        Some(deriv)
    }

    fn save_model_state(&self, kwl: &mut KeywordList, prefix: &str) {
        let c = &self.coefficients;
        kwl.save(&join_key(prefix, "polynomial_format"), "B");
        kwl.save(&join_key(prefix, "line_off"), c.line_offset);
        kwl.save(&join_key(prefix, "samp_off"), c.sample_offset);
        kwl.save(&join_key(prefix, "lat_off"), c.lat_offset);
        kwl.save(&join_key(prefix, "long_off"), c.lon_offset);
        kwl.save(&join_key(prefix, "height_off"), c.height_offset);
        kwl.save(&join_key(prefix, "line_scale"), c.line_scale);
        kwl.save(&join_key(prefix, "samp_scale"), c.sample_scale);
        kwl.save(&join_key(prefix, "lat_scale"), c.lat_scale);
        kwl.save(&join_key(prefix, "long_scale"), c.lon_scale);
        kwl.save(&join_key(prefix, "height_scale"), c.height_scale);
        kwl.save_f64_list(&join_key(prefix, "line_num_coeff"), &c.line_num);
        kwl.save_f64_list(&join_key(prefix, "line_den_coeff"), &c.line_den);
        kwl.save_f64_list(&join_key(prefix, "samp_num_coeff"), &c.samp_num);
        kwl.save_f64_list(&join_key(prefix, "samp_den_coeff"), &c.samp_den);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::{ConstantElevation, GridElevation};
    use approx::assert_relative_eq;

    pub(crate) fn sample_coefficients() -> RpcCoefficients {
        let mut line_num = [0.0; NUM_TERMS];
        let mut line_den = [0.0; NUM_TERMS];
        let mut samp_num = [0.0; NUM_TERMS];
        let mut samp_den = [0.0; NUM_TERMS];
        line_num[1] = 0.02;
        line_num[2] = -1.0;
        line_num[3] = 0.01;
        line_num[4] = 0.001;
        line_num[7] = 0.0005;
        line_den[0] = 1.0;
        line_den[1] = 0.001;
        line_den[2] = -0.0005;
        line_den[3] = 0.0002;
        samp_num[1] = 1.0;
        samp_num[2] = 0.03;
        samp_num[3] = -0.02;
        samp_num[8] = 0.0008;
        samp_den[0] = 1.0;
        samp_den[1] = -0.0003;
        samp_den[2] = 0.0004;
        RpcCoefficients {
            line_offset: 500.0,
            sample_offset: 500.0,
            lat_offset: 40.0,
            lon_offset: -105.0,
            height_offset: 1500.0,
            line_scale: 500.0,
            sample_scale: 500.0,
            lat_scale: 0.05,
            lon_scale: 0.05,
            height_scale: 500.0,
            line_num,
            line_den,
            samp_num,
            samp_den,
        }
    }

    pub(crate) fn sample_rpc() -> RpcModel {
        RpcModel::new("rpc_sample", 1000.0, 1000.0, sample_coefficients()).unwrap()
    }

    #[test]
    fn test_rpc_round_trip() {
        let model = sample_rpc();
        for &(s, l) in &[(0.0, 0.0), (500.0, 500.0), (999.0, 12.5), (250.25, 870.75)] {
            for h in [1000.0, 1500.0, 2100.0] {
                let p = Vector2::new(s, l);
                let g = model.line_sample_height_to_world(&p, h);
                assert!(!g.has_nan());
                let back = model.world_to_line_sample(&g);
                assert_relative_eq!(back, p, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_rpc_reference_point() {
        let model = sample_rpc();
        let ip = model.world_to_line_sample(&GroundPoint::new(40.0, -105.0, 1500.0));
        assert_relative_eq!(ip, Vector2::new(500.0, 500.0), epsilon = 1e-9);
    }

    #[test]
    fn test_rpc_adjustments_shift_image() {
        let mut model = sample_rpc();
        let g = GroundPoint::new(40.01, -105.02, 1400.0);
        let before = model.world_to_line_sample(&g);
        model.set_adjustable_parameter(INTRACK_OFFSET, 0.02).unwrap();
        let after = model.world_to_line_sample(&g);
        assert_relative_eq!(after.y - before.y, 1.0, epsilon = 1e-9);
        assert_relative_eq!(after.x, before.x, epsilon = 1e-9);
    }

    #[test]
    fn test_rpc_analytic_matches_finite_difference() {
        let mut model = sample_rpc();
        model.set_adjustable_parameter(MAP_ROTATION, 0.3).unwrap();
        model.set_adjustable_parameter(INTRACK_SCALE, -0.1).unwrap();
        let g = GroundPoint::new(40.02, -104.98, 1700.0);
        for index in 0..model.number_of_adjustable_parameters() {
            let analytic = model.analytic_forward_deriv(index, &g).unwrap();
            let value = model.adjustable_parameters().value(index).unwrap();
            let delta = 1e-5;
            let mut probe = model.clone();
            probe.set_adjustable_parameter(index, value + delta).unwrap();
            let plus = probe.world_to_line_sample(&g);
            probe.set_adjustable_parameter(index, value - delta).unwrap();
            let minus = probe.world_to_line_sample(&g);
            let numeric = (plus - minus) / (2.0 * delta);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_rpc_imaging_ray_reproduces_height_intersection() {
        let model = sample_rpc();
        let p = Vector2::new(321.0, 654.0);
        let ray = model.imaging_ray(&p).unwrap();
        let hit = ray.intersect_ground(1500.0, &model.geometry().ellipsoid).unwrap();
        let direct = model.line_sample_height_to_world(&p, 1500.0);
        // The RPC ray is a chord through the polynomial surface, not an exact line.
        assert!(hit.distance_to(&direct) < 2.0);
    }

    #[test]
    fn test_rpc_line_sample_to_world_over_terrain() {
        let model = sample_rpc();
        let p = Vector2::new(400.0, 600.0);
        let flat = model.line_sample_to_world(&p, &ConstantElevation::new(1750.0));
        assert_relative_eq!(flat.height, 1750.0, epsilon = 1e-9);
        assert_relative_eq!(model.world_to_line_sample(&flat), p, epsilon = 1e-3);

        let heights = (0..9).map(|i| 1200.0 + 40.0 * i as f64).collect();
        let grid = GridElevation::new(40.1, -105.1, 0.1, 3, 3, heights).unwrap();
        let g = model.line_sample_to_world(&p, &grid);
        assert!(!g.has_nan());
        assert_relative_eq!(g.height, grid.height_above_ellipsoid(&g), epsilon = 1e-2);
    }

    #[test]
    fn test_rpc_footprint_and_gsd() {
        let model = sample_rpc();
        assert_eq!(model.bounding_ground_polygon().len(), 4);
        let gsd = model.geometry().gsd;
        // 0.05 deg over 500 lines.
        assert!(gsd.y > 10.0 && gsd.y < 12.0, "{gsd:?}");
        assert!(model.geometry().seed.is_some());
    }

    #[test]
    fn test_rpc_rejects_zero_scale() {
        let mut coefficients = sample_coefficients();
        coefficients.lat_scale = 0.0;
        assert!(RpcModel::new("bad", 10.0, 10.0, coefficients).is_err());
    }

    #[test]
    fn test_rpc_load_from_yaml() {
        let model = crate::sensor::load_model_from_yaml("samples/rpc.yaml", "").unwrap();
        assert_eq!(model.model_type(), "rpc");
        assert_eq!(model.number_of_adjustable_parameters(), 5);
        let ip = model.world_to_line_sample(&GroundPoint::new(40.0, -105.0, 1500.0));
        assert_relative_eq!(ip, Vector2::new(500.0, 500.0), epsilon = 1e-9);
    }
}
