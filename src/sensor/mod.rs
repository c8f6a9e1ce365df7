//! Sensor models: the mapping between image pixels and positions on the Earth.
//!
//! Every concrete model implements [`SensorModel`]. A model only has to provide
//! `line_sample_height_to_world` (plus its imaging ray and cache rebuild); the
//! trait supplies the generic inverse (`world_to_line_sample`) by Newton
//! iteration, the terrain-aware forward projection (`line_sample_to_world`) by
//! fixed-point iteration over heights, extrapolation through a bilinear seed,
//! and finite-difference partials with respect to the adjustable parameters.
//!
//! Image points are `(sample, line)` in a [`Vector2`]. Ground points are
//! geodetic [`GroundPoint`]s.

use log::debug;
use nalgebra::{Matrix2x3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod adjustable;
pub mod frame;
pub mod pushbroom;
pub mod rpc;

pub use adjustable::{AdjustableParameter, AdjustableParameterStore, Adjustment};
pub use frame::FrameModel;
pub use pushbroom::PushbroomModel;
pub use rpc::RpcModel;

use crate::geometry::{
    BilinearProjection, EcefRay, ElevationSource, Ellipsoid, GroundPoint, ImageRect,
};
use crate::keywordlist::{join_key, KeywordList, KeywordListError};

#[derive(thiserror::Error, Debug)]
pub enum SensorModelError {
    #[error("Image point ({0}, {1}) is outside the image")]
    OutsideImage(f64, f64),
    #[error("Imaging ray does not intersect the ellipsoid")]
    RayMissesEllipsoid,
    #[error("Iteration did not converge after {0} iterations")]
    NotConverged(usize),
    #[error("Invalid sensor model parameters: {0}")]
    InvalidParams(String),
    #[error("Adjustable parameter index {0} is out of range")]
    ParameterIndexOutOfRange(usize),
    #[error("Unknown sensor model type: {0}")]
    UnknownModelType(String),
    #[error("Keyword list error: {0}")]
    KeywordList(#[from] KeywordListError),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for SensorModelError {
    fn from(err: std::io::Error) -> Self {
        SensorModelError::IOError(err.to_string())
    }
}

/// Tolerances of the generic iterative projections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationSettings {
    /// Newton stop criterion of `world_to_line_sample`, in pixels.
    pub pixel_tolerance: f64,
    pub max_iterations: usize,
    /// Height change below which the terrain iteration is at its fixed point.
    pub height_tolerance_m: f64,
    /// Slack of the point-in-image test.
    pub inside_image_epsilon: f64,
}

impl Default for IterationSettings {
    fn default() -> Self {
        Self {
            pixel_tolerance: 1e-6,
            max_iterations: 20,
            height_tolerance_m: 1e-3,
            inside_image_epsilon: 2.0,
        }
    }
}

impl IterationSettings {
    fn save_state(&self, kwl: &mut KeywordList, prefix: &str) {
        kwl.save(&join_key(prefix, "pixel_tolerance"), self.pixel_tolerance);
        kwl.save(&join_key(prefix, "max_iterations"), self.max_iterations);
        kwl.save(
            &join_key(prefix, "height_tolerance"),
            self.height_tolerance_m,
        );
        kwl.save(
            &join_key(prefix, "inside_image_epsilon"),
            self.inside_image_epsilon,
        );
    }

    fn load_state(kwl: &KeywordList, prefix: &str) -> Result<Self, KeywordListError> {
        let defaults = Self::default();
        Ok(Self {
            pixel_tolerance: kwl.get_or(
                &join_key(prefix, "pixel_tolerance"),
                defaults.pixel_tolerance,
            )?,
            max_iterations: kwl.get_or(
                &join_key(prefix, "max_iterations"),
                defaults.max_iterations,
            )?,
            height_tolerance_m: kwl.get_or(
                &join_key(prefix, "height_tolerance"),
                defaults.height_tolerance_m,
            )?,
            inside_image_epsilon: kwl.get_or(
                &join_key(prefix, "inside_image_epsilon"),
                defaults.inside_image_epsilon,
            )?,
        })
    }
}

/// State shared by every sensor model.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorGeometry {
    pub image_id: String,
    /// `(samples, lines)`.
    pub image_size: Vector2<f64>,
    pub image_clip_rect: ImageRect,
    pub ref_image_point: Vector2<f64>,
    pub ref_ground_point: GroundPoint,
    /// Absolute horizontal accuracy, meters.
    pub nominal_pos_error: f64,
    /// Relative accuracy, meters.
    pub relative_pos_error: f64,
    pub ellipsoid: Ellipsoid,
    pub iteration: IterationSettings,
    pub adjustable_parameters: AdjustableParameterStore,
    /// Ground sample distance along samples (`x`) and lines (`y`), meters.
    pub gsd: Vector2<f64>,
    pub mean_gsd: f64,
    pub bounding_ground_polygon: Vec<GroundPoint>,
    pub seed: Option<BilinearProjection>,
}

impl SensorGeometry {
    pub fn new(image_id: &str, samples: f64, lines: f64) -> Self {
        let rect = ImageRect::from_size(samples, lines);
        Self {
            image_id: image_id.to_string(),
            image_size: Vector2::new(samples, lines),
            image_clip_rect: rect,
            ref_image_point: rect.center(),
            ref_ground_point: GroundPoint::nan(),
            nominal_pos_error: 0.0,
            relative_pos_error: 0.0,
            ellipsoid: Ellipsoid::default(),
            iteration: IterationSettings::default(),
            adjustable_parameters: AdjustableParameterStore::new(),
            gsd: Vector2::new(f64::NAN, f64::NAN),
            mean_gsd: f64::NAN,
            bounding_ground_polygon: Vec::new(),
            seed: None,
        }
    }

    /// Height used when a projection has no better information.
    pub fn reference_height(&self) -> f64 {
        if self.ref_ground_point.height.is_finite() {
            self.ref_ground_point.height
        } else {
            0.0
        }
    }

    pub fn save_state(&self, kwl: &mut KeywordList, prefix: &str) {
        kwl.save(&join_key(prefix, "image_id"), &self.image_id);
        kwl.save_f64_list(
            &join_key(prefix, "image_size"),
            &[self.image_size.x, self.image_size.y],
        );
        let r = &self.image_clip_rect;
        kwl.save_f64_list(
            &join_key(prefix, "rect"),
            &[r.min_x, r.min_y, r.max_x, r.max_y],
        );
        kwl.save_f64_list(
            &join_key(prefix, "ref_point_line_sample"),
            &[self.ref_image_point.y, self.ref_image_point.x],
        );
        let g = &self.ref_ground_point;
        kwl.save_f64_list(
            &join_key(prefix, "ref_point_lat_lon_hgt"),
            &[g.lat, g.lon, g.height],
        );
        kwl.save(&join_key(prefix, "ce90_absolute"), self.nominal_pos_error);
        kwl.save(&join_key(prefix, "ce90_relative"), self.relative_pos_error);
        kwl.save_f64_list(
            &join_key(prefix, "ellipsoid"),
            &[self.ellipsoid.a, self.ellipsoid.b],
        );
        self.iteration.save_state(kwl, prefix);
        self.adjustable_parameters.save_state(kwl, prefix);
    }

    pub fn load_state(kwl: &KeywordList, prefix: &str) -> Result<Self, SensorModelError> {
        let size = kwl.get_f64_list(&join_key(prefix, "image_size"))?;
        if size.len() != 2 {
            return Err(SensorModelError::InvalidParams(
                "image_size needs two values".to_string(),
            ));
        }
        let mut geometry = SensorGeometry::new(
            kwl.find(&join_key(prefix, "image_id")).unwrap_or_default(),
            size[0],
            size[1],
        );
        if let Some(rect) = optional_list(kwl, &join_key(prefix, "rect"), 4)? {
            geometry.image_clip_rect = ImageRect::new(rect[0], rect[1], rect[2], rect[3]);
        }
        if let Some(p) = optional_list(kwl, &join_key(prefix, "ref_point_line_sample"), 2)? {
            geometry.ref_image_point = Vector2::new(p[1], p[0]);
        }
        if let Some(g) = optional_list(kwl, &join_key(prefix, "ref_point_lat_lon_hgt"), 3)? {
            geometry.ref_ground_point = GroundPoint::new(g[0], g[1], g[2]);
        }
        geometry.nominal_pos_error = kwl.get_or(&join_key(prefix, "ce90_absolute"), 0.0)?;
        geometry.relative_pos_error = kwl.get_or(&join_key(prefix, "ce90_relative"), 0.0)?;
        if let Some(e) = optional_list(kwl, &join_key(prefix, "ellipsoid"), 2)? {
            geometry.ellipsoid = Ellipsoid { a: e[0], b: e[1] };
        }
        geometry.iteration = IterationSettings::load_state(kwl, prefix)?;
        if kwl.contains(&join_key(prefix, "number_of_adjustments")) {
            geometry.adjustable_parameters = AdjustableParameterStore::load_state(kwl, prefix)?;
        }
        Ok(geometry)
    }
}

fn optional_list(
    kwl: &KeywordList,
    key: &str,
    len: usize,
) -> Result<Option<Vec<f64>>, SensorModelError> {
    if !kwl.contains(key) {
        return Ok(None);
    }
    let values = kwl.get_f64_list(key)?;
    if values.len() != len {
        return Err(SensorModelError::InvalidParams(format!(
            "{key} needs {len} values"
        )));
    }
    Ok(Some(values))
}

/// The projection capability shared by all sensor models.
pub trait SensorModel {
    fn geometry(&self) -> &SensorGeometry;

    /// Mutable access for model implementations. Callers that change
    /// adjustable parameters through it must follow up with
    /// [`SensorModel::adjustable_parameters_changed`].
    fn geometry_mut(&mut self) -> &mut SensorGeometry;

    /// Type tag used by persistence and [`create_model`].
    fn model_type(&self) -> &'static str;

    /// Intersects the imaging ray of `image_point` with the surface `height`
    /// meters above the ellipsoid. Returns a NaN point on failure.
    fn line_sample_height_to_world(&self, image_point: &Vector2<f64>, height: f64) -> GroundPoint;

    /// Ray from the sensor through `image_point`, including all adjustable offsets.
    fn imaging_ray(&self, image_point: &Vector2<f64>) -> Option<EcefRay>;

    /// Rebuilds every cached quantity from the base parameters plus the current
    /// adjustable offsets. Implementations finish with [`SensorModel::refresh_footprint`].
    fn update_model(&mut self);

    /// Writes model-specific keywords; the shared state is handled by `save_state`.
    fn save_model_state(&self, kwl: &mut KeywordList, prefix: &str);

    fn save_state(&self, kwl: &mut KeywordList, prefix: &str) {
        kwl.save(&join_key(prefix, "type"), self.model_type());
        self.geometry().save_state(kwl, prefix);
        self.save_model_state(kwl, prefix);
    }

    fn image_clip_rect(&self) -> &ImageRect {
        &self.geometry().image_clip_rect
    }

    fn inside_image(&self, image_point: &Vector2<f64>) -> bool {
        let geometry = self.geometry();
        geometry
            .image_clip_rect
            .contains(image_point, geometry.iteration.inside_image_epsilon)
    }

    /// Image to ground over terrain.
    ///
    /// Alternates height lookups and `line_sample_height_to_world` until the
    /// ground point moves less than the pixel tolerance times the GSD or the
    /// height stops changing. Points outside the image go through
    /// [`SensorModel::extrapolate_to_world`].
    fn line_sample_to_world(
        &self,
        image_point: &Vector2<f64>,
        elevation: &dyn ElevationSource,
    ) -> GroundPoint {
        if image_point.iter().any(|v| !v.is_finite()) {
            return GroundPoint::nan();
        }
        if !self.inside_image(image_point) {
            return self.extrapolate_to_world(image_point, elevation);
        }
        let geometry = self.geometry();
        let settings = geometry.iteration;
        let gsd = if geometry.mean_gsd.is_finite() {
            geometry.mean_gsd
        } else {
            1.0
        };
        let tolerance_m = gsd * settings.pixel_tolerance;

        let mut height = elevation.height_above_ellipsoid(&geometry.ref_ground_point);
        if !height.is_finite() {
            height = geometry.reference_height();
        }
        let mut ground = self.line_sample_height_to_world(image_point, height);
        for _ in 0..settings.max_iterations {
            if ground.is_lat_lon_nan() {
                return GroundPoint::nan();
            }
            let mut next_height = elevation.height_above_ellipsoid(&ground);
            if !next_height.is_finite() {
                next_height = height;
            }
            let next = self.line_sample_height_to_world(image_point, next_height);
            if next.is_lat_lon_nan() {
                return GroundPoint::nan();
            }
            let moved = ground.distance_to(&next);
            let dh = (next_height - height).abs();
            ground = next;
            height = next_height;
            if moved <= tolerance_m || dh <= settings.height_tolerance_m {
                return ground;
            }
        }
        debug!(
            "{}: line_sample_to_world did not converge at ({}, {})",
            geometry.image_id, image_point.x, image_point.y
        );
        GroundPoint::nan()
    }

    /// Ground to image by Newton iteration on `line_sample_height_to_world`.
    ///
    /// The start point comes from the bilinear seed (or the reference point).
    /// A run that does not converge falls back to the seed extrapolation.
    fn world_to_line_sample(&self, ground_point: &GroundPoint) -> Vector2<f64> {
        if ground_point.is_lat_lon_nan() {
            return Vector2::new(f64::NAN, f64::NAN);
        }
        let geometry = self.geometry();
        let settings = geometry.iteration;
        let height = if ground_point.height.is_finite() {
            ground_point.height
        } else {
            geometry.reference_height()
        };
        let mut ip = match &geometry.seed {
            Some(seed) => seed.world_to_line_sample(ground_point),
            None => geometry.ref_image_point,
        };
        if ip.iter().any(|v| !v.is_finite()) {
            ip = geometry.ref_image_point;
        }

        for _ in 0..settings.max_iterations {
            let gp = self.line_sample_height_to_world(&ip, height);
            let gx = self.line_sample_height_to_world(&(ip + Vector2::new(1.0, 0.0)), height);
            let gy = self.line_sample_height_to_world(&(ip + Vector2::new(0.0, 1.0)), height);
            if gp.is_lat_lon_nan() || gx.is_lat_lon_nan() || gy.is_lat_lon_nan() {
                break;
            }
            let dlat_du = gx.lat - gp.lat;
            let dlon_du = wrap_lon(gx.lon - gp.lon);
            let dlat_dv = gy.lat - gp.lat;
            let dlon_dv = wrap_lon(gy.lon - gp.lon);
            let det = dlon_du * dlat_dv - dlon_dv * dlat_du;
            if det.abs() < f64::MIN_POSITIVE {
                break;
            }
            let dlat = ground_point.lat - gp.lat;
            let dlon = wrap_lon(ground_point.lon - gp.lon);
            let du = (dlat_dv * dlon - dlon_dv * dlat) / det;
            let dv = (dlon_du * dlat - dlat_du * dlon) / det;
            ip += Vector2::new(du, dv);
            if du.abs() < settings.pixel_tolerance && dv.abs() < settings.pixel_tolerance {
                return ip;
            }
        }
        if self.inside_image(&ip) {
            return ip;
        }
        self.extrapolate_to_image(ground_point)
    }

    /// Image point outside the valid domain to ground, via the bilinear seed.
    fn extrapolate_to_world(
        &self,
        image_point: &Vector2<f64>,
        elevation: &dyn ElevationSource,
    ) -> GroundPoint {
        match &self.geometry().seed {
            Some(seed) => {
                let mut ground = seed.line_sample_to_world(image_point);
                let height = elevation.height_above_ellipsoid(&ground);
                if height.is_finite() {
                    ground.height = height;
                }
                ground
            }
            None => GroundPoint::nan(),
        }
    }

    /// Ground point outside the valid domain to image, via the bilinear seed.
    fn extrapolate_to_image(&self, ground_point: &GroundPoint) -> Vector2<f64> {
        match &self.geometry().seed {
            Some(seed) => seed.world_to_line_sample(ground_point),
            None => Vector2::new(f64::NAN, f64::NAN),
        }
    }

    /// Rebuilds the corner footprint, the bilinear seed and the GSD.
    fn refresh_footprint(&mut self) {
        let geometry = self.geometry();
        let height = geometry.reference_height();
        let corners = geometry.image_clip_rect.corners();
        let center = geometry.image_clip_rect.center();
        let ground = corners.map(|c| self.line_sample_height_to_world(&c, height));
        let seed = BilinearProjection::new(&corners, &ground);

        let g0 = self.line_sample_height_to_world(&center, height);
        let gx = self.line_sample_height_to_world(&(center + Vector2::new(1.0, 0.0)), height);
        let gy = self.line_sample_height_to_world(&(center + Vector2::new(0.0, 1.0)), height);
        let gsd = Vector2::new(g0.distance_to(&gx), g0.distance_to(&gy));

        let geometry = self.geometry_mut();
        geometry.bounding_ground_polygon = ground.to_vec();
        geometry.seed = seed;
        if gsd.iter().all(|v| v.is_finite()) {
            geometry.gsd = gsd;
            geometry.mean_gsd = 0.5 * (gsd.x + gsd.y);
        }
    }

    fn bounding_ground_polygon(&self) -> &[GroundPoint] {
        &self.geometry().bounding_ground_polygon
    }

    fn adjustable_parameters(&self) -> &AdjustableParameterStore {
        &self.geometry().adjustable_parameters
    }

    fn number_of_adjustable_parameters(&self) -> usize {
        self.adjustable_parameters().number_of_parameters()
    }

    fn compute_parameter_offset(&self, index: usize) -> f64 {
        self.adjustable_parameters().compute_offset(index)
    }

    /// Called after any adjustable parameter changed.
    fn adjustable_parameters_changed(&mut self) {
        self.update_model();
    }

    fn set_adjustable_parameter(&mut self, index: usize, value: f64) -> Result<(), SensorModelError> {
        self.geometry_mut()
            .adjustable_parameters
            .set_value(index, value)?;
        self.adjustable_parameters_changed();
        Ok(())
    }

    fn set_adjustable_parameters(&mut self, values: &[f64]) -> Result<(), SensorModelError> {
        let store = &mut self.geometry_mut().adjustable_parameters;
        if values.len() != store.number_of_parameters() {
            return Err(SensorModelError::InvalidParams(format!(
                "expected {} parameter values, got {}",
                store.number_of_parameters(),
                values.len()
            )));
        }
        for (i, v) in values.iter().enumerate() {
            store.set_value(i, *v)?;
        }
        self.adjustable_parameters_changed();
        Ok(())
    }

    fn set_parameter_locked(&mut self, index: usize, locked: bool) -> Result<(), SensorModelError> {
        self.geometry_mut()
            .adjustable_parameters
            .set_locked(index, locked)
    }

    fn set_parameter_sigma(&mut self, index: usize, sigma: f64) -> Result<(), SensorModelError> {
        self.geometry_mut()
            .adjustable_parameters
            .set_sigma(index, sigma)?;
        self.adjustable_parameters_changed();
        Ok(())
    }

    /// Restores every adjustable parameter of the current set to its center.
    fn reset_adjustable_parameters(&mut self) {
        self.geometry_mut().adjustable_parameters.reset_adjustment();
        self.adjustable_parameters_changed();
    }

    /// Independent copy with the given parameter values, for read-only evaluation.
    fn with_parameters(&self, values: &[f64]) -> Result<Self, SensorModelError>
    where
        Self: Sized + Clone,
    {
        let mut snapshot = self.clone();
        snapshot.set_adjustable_parameters(values)?;
        Ok(snapshot)
    }

    /// Analytic partial of `world_to_line_sample` with respect to parameter
    /// `index` (per normalized unit). `None` selects finite differences.
    fn analytic_forward_deriv(&self, _index: usize, _ground_point: &GroundPoint) -> Option<Vector2<f64>> {
        None
    }

    /// Partial of the image position with respect to one adjustable parameter.
    fn forward_deriv(
        &self,
        index: usize,
        ground_point: &GroundPoint,
        delta: f64,
    ) -> Result<Vector2<f64>, SensorModelError>
    where
        Self: Sized + Clone,
    {
        if let Some(deriv) = self.analytic_forward_deriv(index, ground_point) {
            return Ok(deriv);
        }
        let value = self.adjustable_parameters().value(index)?;
        let mut probe = self.clone();
        probe.set_adjustable_parameter(index, value + delta)?;
        let plus = probe.world_to_line_sample(ground_point);
        probe.set_adjustable_parameter(index, value - delta)?;
        let minus = probe.world_to_line_sample(ground_point);
        Ok((plus - minus) / (2.0 * delta))
    }

    /// Partial of the ground position at `height`, as local `(north, east, up)`
    /// meters, with respect to one adjustable parameter.
    fn inverse_deriv(
        &self,
        index: usize,
        image_point: &Vector2<f64>,
        height: f64,
        delta: f64,
    ) -> Result<Vector3<f64>, SensorModelError>
    where
        Self: Sized + Clone,
    {
        let base = self.line_sample_height_to_world(image_point, height);
        if base.is_lat_lon_nan() {
            return Err(SensorModelError::RayMissesEllipsoid);
        }
        let value = self.adjustable_parameters().value(index)?;
        let mut probe = self.clone();
        probe.set_adjustable_parameter(index, value + delta)?;
        let plus = probe.line_sample_height_to_world(image_point, height);
        probe.set_adjustable_parameter(index, value - delta)?;
        let minus = probe.line_sample_height_to_world(image_point, height);
        if plus.is_lat_lon_nan() || minus.is_lat_lon_nan() {
            return Err(SensorModelError::RayMissesEllipsoid);
        }
        Ok((base.neu_to(&plus) - base.neu_to(&minus)) / (2.0 * delta))
    }

    /// Partials of `(sample, line)` with respect to local `(north, east, up)`
    /// ground displacements in meters.
    fn coordinate_forward_deriv(&self, ground_point: &GroundPoint, step_m: f64) -> Matrix2x3<f64> {
        let mut deriv = Matrix2x3::zeros();
        for axis in 0..3 {
            let mut offset = Vector3::zeros();
            offset[axis] = step_m;
            let plus = self.world_to_line_sample(&ground_point.offset_neu(&offset));
            let minus = self.world_to_line_sample(&ground_point.offset_neu(&(-offset)));
            deriv.set_column(axis, &((plus - minus) / (2.0 * step_m)));
        }
        deriv
    }
}

fn wrap_lon(dlon: f64) -> f64 {
    if dlon > 180.0 {
        dlon - 360.0
    } else if dlon < -180.0 {
        dlon + 360.0
    } else {
        dlon
    }
}

/// Closed set of sensor models known to the factory.
#[derive(Debug, Clone, PartialEq)]
pub enum AnySensorModel {
    Rpc(RpcModel),
    Frame(FrameModel),
    Pushbroom(PushbroomModel),
}

macro_rules! delegate {
    ($self:ident, $model:ident => $body:expr) => {
        match $self {
            AnySensorModel::Rpc($model) => $body,
            AnySensorModel::Frame($model) => $body,
            AnySensorModel::Pushbroom($model) => $body,
        }
    };
}

impl SensorModel for AnySensorModel {
    fn geometry(&self) -> &SensorGeometry {
        delegate!(self, m => m.geometry())
    }

    fn geometry_mut(&mut self) -> &mut SensorGeometry {
        delegate!(self, m => m.geometry_mut())
    }

    fn model_type(&self) -> &'static str {
        delegate!(self, m => m.model_type())
    }

    fn line_sample_height_to_world(&self, image_point: &Vector2<f64>, height: f64) -> GroundPoint {
        delegate!(self, m => m.line_sample_height_to_world(image_point, height))
    }

    fn imaging_ray(&self, image_point: &Vector2<f64>) -> Option<EcefRay> {
        delegate!(self, m => m.imaging_ray(image_point))
    }

    fn update_model(&mut self) {
        delegate!(self, m => m.update_model())
    }

    fn save_model_state(&self, kwl: &mut KeywordList, prefix: &str) {
        delegate!(self, m => m.save_model_state(kwl, prefix))
    }

    fn world_to_line_sample(&self, ground_point: &GroundPoint) -> Vector2<f64> {
        delegate!(self, m => m.world_to_line_sample(ground_point))
    }

    fn line_sample_to_world(
        &self,
        image_point: &Vector2<f64>,
        elevation: &dyn ElevationSource,
    ) -> GroundPoint {
        delegate!(self, m => m.line_sample_to_world(image_point, elevation))
    }

    fn analytic_forward_deriv(&self, index: usize, ground_point: &GroundPoint) -> Option<Vector2<f64>> {
        delegate!(self, m => m.analytic_forward_deriv(index, ground_point))
    }
}

impl From<RpcModel> for AnySensorModel {
    fn from(model: RpcModel) -> Self {
        AnySensorModel::Rpc(model)
    }
}

impl From<FrameModel> for AnySensorModel {
    fn from(model: FrameModel) -> Self {
        AnySensorModel::Frame(model)
    }
}

impl From<PushbroomModel> for AnySensorModel {
    fn from(model: PushbroomModel) -> Self {
        AnySensorModel::Pushbroom(model)
    }
}

/// Builds a sensor model from the `type` keyword under `prefix`.
pub fn create_model(kwl: &KeywordList, prefix: &str) -> Result<AnySensorModel, SensorModelError> {
    let model_type = kwl.require(&join_key(prefix, "type"))?;
    match model_type {
        RpcModel::TYPE_NAME => Ok(RpcModel::load_state(kwl, prefix)?.into()),
        FrameModel::TYPE_NAME => Ok(FrameModel::load_state(kwl, prefix)?.into()),
        PushbroomModel::TYPE_NAME => Ok(PushbroomModel::load_state(kwl, prefix)?.into()),
        other => Err(SensorModelError::UnknownModelType(other.to_string())),
    }
}

/// Loads a sensor model from a flat YAML keyword file.
pub fn load_model_from_yaml(path: &str, prefix: &str) -> Result<AnySensorModel, SensorModelError> {
    let kwl = KeywordList::load_from_yaml(path)?;
    create_model(&kwl, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ConstantElevation;

    #[test]
    fn test_factory_rejects_unknown_type() {
        let mut kwl = KeywordList::new();
        kwl.save("image0.type", "applanix");
        assert!(matches!(
            create_model(&kwl, "image0"),
            Err(SensorModelError::UnknownModelType(t)) if t == "applanix"
        ));
        assert!(matches!(
            create_model(&kwl, "image1"),
            Err(SensorModelError::KeywordList(KeywordListError::MissingKeyword(_)))
        ));
    }

    #[test]
    fn test_factory_round_trip_every_type() {
        let models: Vec<AnySensorModel> = vec![
            rpc::tests::sample_rpc().into(),
            frame::tests::sample_frame().into(),
            pushbroom::tests::sample_pushbroom().into(),
        ];
        for mut model in models {
            model.set_adjustable_parameter(0, 0.2).unwrap();
            let mut kwl = KeywordList::new();
            model.save_state(&mut kwl, "image0.");
            let loaded = create_model(&kwl, "image0.").unwrap();
            assert_eq!(loaded.model_type(), model.model_type());
            assert_eq!(
                loaded.adjustable_parameters().values(),
                model.adjustable_parameters().values()
            );
            let p = Vector2::new(120.5, 310.25);
            let a = model.line_sample_height_to_world(&p, 150.0);
            let b = loaded.line_sample_height_to_world(&p, 150.0);
            assert!(a.distance_to(&b) < 1e-6, "{}", model.model_type());
        }
    }

    #[test]
    fn test_outside_image_without_seed_is_nan() {
        let mut model = rpc::tests::sample_rpc();
        model.geometry_mut().seed = None;
        let far = Vector2::new(-5000.0, -5000.0);
        assert!(model
            .line_sample_to_world(&far, &ConstantElevation::new(0.0))
            .has_nan());
    }

    #[test]
    fn test_inside_image_epsilon() {
        let model = frame::tests::sample_frame();
        let rect = *model.image_clip_rect();
        assert!(model.inside_image(&Vector2::new(rect.max_x + 1.5, rect.max_y)));
        assert!(!model.inside_image(&Vector2::new(rect.max_x + 2.5, rect.max_y)));
    }
}
