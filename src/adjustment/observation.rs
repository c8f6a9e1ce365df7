//! Bundle input: images, ground observations and their image measurements.

use log::warn;
use nalgebra::{DMatrix, Matrix2, Matrix2x3, Matrix3, Vector2};
use serde::{Deserialize, Serialize};

use super::AdjustmentError;
use crate::geometry::GroundPoint;
use crate::sensor::SensorModel;

/// A-priori horizontal and vertical sigma, in meters, of a ground point whose
/// position is unknown and will be seeded by back-projection.
pub const UNKNOWN_GROUND_SIGMA_M: f64 = 1000.0;

/// Observed image location of a ground feature in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub image_index: usize,
    /// `(sample, line)`.
    pub image_point: Vector2<f64>,
    /// Pixels squared.
    pub covariance: Matrix2<f64>,
}

impl Measurement {
    pub fn new(image_index: usize, image_point: Vector2<f64>, sigma_px: f64) -> Self {
        Self::with_covariance(
            image_index,
            image_point,
            Matrix2::identity() * (sigma_px * sigma_px),
        )
    }

    pub fn with_covariance(
        image_index: usize,
        image_point: Vector2<f64>,
        covariance: Matrix2<f64>,
    ) -> Self {
        Self {
            image_index,
            image_point,
            covariance,
        }
    }

    /// Inverse covariance, or `None` when the covariance is not positive definite.
    pub fn weight(&self) -> Option<Matrix2<f64>> {
        self.covariance.cholesky().map(|c| c.inverse())
    }
}

/// A ground feature with its a-priori position and image measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    /// NaN when unknown; seeded at initialization.
    pub ground_point: GroundPoint,
    /// Local `(north, east, up)` covariance, meters squared.
    pub ground_covariance: Matrix3<f64>,
    pub measurements: Vec<Measurement>,
}

impl Observation {
    /// Observation with a known ground position and isotropic sigma in meters.
    pub fn new(id: &str, ground_point: GroundPoint, ground_sigma_m: f64) -> Self {
        Self {
            id: id.to_string(),
            ground_point,
            ground_covariance: Matrix3::identity() * (ground_sigma_m * ground_sigma_m),
            measurements: Vec::new(),
        }
    }

    /// Tie observation with an unknown ground position.
    pub fn unknown(id: &str) -> Self {
        Self::new(id, GroundPoint::nan(), UNKNOWN_GROUND_SIGMA_M)
    }

    pub fn with_ground_covariance(mut self, covariance: Matrix3<f64>) -> Self {
        self.ground_covariance = covariance;
        self
    }

    pub fn with_measurement(mut self, measurement: Measurement) -> Self {
        self.measurements.push(measurement);
        self
    }

    pub fn add_measurement(&mut self, measurement: Measurement) {
        self.measurements.push(measurement);
    }

    pub fn is_ground_unset(&self) -> bool {
        self.ground_point.has_nan()
    }

    /// Inverse ground covariance, or `None` when it is not positive definite.
    pub fn ground_weight(&self) -> Option<Matrix3<f64>> {
        self.ground_covariance.cholesky().map(|c| c.inverse())
    }
}

/// Output buffers of [`ObservationSet::evaluate`], one entry per measurement in
/// observation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Observed minus predicted `(sample, line)`.
    pub residuals: Vec<Vector2<f64>>,
    /// Partials of `(sample, line)` with respect to local `(north, east, up)` meters.
    pub ground_partials: Vec<Matrix2x3<f64>>,
    /// Partials of `(sample, line)` with respect to the normalized adjustable
    /// parameters of the measuring image (`2 x n_params`).
    pub param_partials: Vec<DMatrix<f64>>,
    /// False where the model could not project the measurement.
    pub valid: Vec<bool>,
}

impl Evaluation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.residuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residuals.is_empty()
    }

    fn clear(&mut self) {
        self.residuals.clear();
        self.ground_partials.clear();
        self.param_partials.clear();
        self.valid.clear();
    }
}

/// Observations plus the sensor models of the images they were measured in.
///
/// Every measurement refers to its image by index, so all observations of one
/// image share the same model instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSet<M> {
    images: Vec<M>,
    observations: Vec<Observation>,
}

impl<M> Default for ObservationSet<M> {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            observations: Vec::new(),
        }
    }
}

impl<M: SensorModel + Clone> ObservationSet<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_images(images: Vec<M>) -> Self {
        Self {
            images,
            observations: Vec::new(),
        }
    }

    pub fn add_image(&mut self, model: M) -> usize {
        self.images.push(model);
        self.images.len() - 1
    }

    /// Adds an observation after checking its image indices.
    pub fn add_observation(&mut self, observation: Observation) -> Result<usize, AdjustmentError> {
        for m in &observation.measurements {
            if m.image_index >= self.images.len() {
                return Err(AdjustmentError::ImageIndexOutOfRange {
                    index: m.image_index,
                    images: self.images.len(),
                });
            }
        }
        self.observations.push(observation);
        Ok(self.observations.len() - 1)
    }

    pub fn images(&self) -> &[M] {
        &self.images
    }

    pub fn image(&self, index: usize) -> Option<&M> {
        self.images.get(index)
    }

    pub(crate) fn image_mut(&mut self, index: usize) -> Option<&mut M> {
        self.images.get_mut(index)
    }

    pub fn into_images(self) -> Vec<M> {
        self.images
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub(crate) fn observations_mut(&mut self) -> &mut [Observation] {
        &mut self.observations
    }

    pub fn find_observation(&self, id: &str) -> Option<&Observation> {
        self.observations.iter().find(|o| o.id == id)
    }

    pub fn num_obs(&self) -> usize {
        self.observations.len()
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_meas(&self) -> usize {
        self.observations.iter().map(|o| o.measurements.len()).sum()
    }

    pub fn image_parameter_count(&self, index: usize) -> usize {
        self.images
            .get(index)
            .map_or(0, |m| m.number_of_adjustable_parameters())
    }

    /// Total adjustable parameters over all images.
    pub fn num_params(&self) -> usize {
        self.images
            .iter()
            .map(|m| m.number_of_adjustable_parameters())
            .sum()
    }

    /// Size of the unknown vector: all parameters plus three per observation.
    pub fn rank(&self) -> usize {
        self.num_params() + 3 * self.num_obs()
    }

    /// Index of each image's first parameter in the unknown vector.
    pub fn parameter_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.images.len());
        let mut next = 0;
        for model in &self.images {
            offsets.push(next);
            next += model.number_of_adjustable_parameters();
        }
        offsets
    }

    pub fn measurement_covariance(&self, observation: usize, measurement: usize) -> Option<&Matrix2<f64>> {
        self.observations
            .get(observation)?
            .measurements
            .get(measurement)
            .map(|m| &m.covariance)
    }

    pub fn observation_covariance(&self, observation: usize) -> Option<&Matrix3<f64>> {
        self.observations
            .get(observation)
            .map(|o| &o.ground_covariance)
    }

    /// `(observation, measurement)` of every measurement, in evaluation order.
    pub fn measurement_indices(&self) -> Vec<(usize, usize)> {
        self.observations
            .iter()
            .enumerate()
            .flat_map(|(k, o)| (0..o.measurements.len()).map(move |j| (k, j)))
            .collect()
    }

    /// Checks everything initialization relies on, without touching any model.
    pub fn validate(&self) -> Result<(), AdjustmentError> {
        if self.observations.is_empty() {
            return Err(AdjustmentError::EmptyObservationSet);
        }
        for observation in &self.observations {
            if observation.measurements.is_empty() {
                return Err(AdjustmentError::ObservationWithoutMeasurements(
                    observation.id.clone(),
                ));
            }
            if observation.ground_weight().is_none() {
                return Err(AdjustmentError::MissingCovariance(format!(
                    "ground covariance of observation {}",
                    observation.id
                )));
            }
            for (j, m) in observation.measurements.iter().enumerate() {
                if m.image_index >= self.images.len() {
                    return Err(AdjustmentError::ImageIndexOutOfRange {
                        index: m.image_index,
                        images: self.images.len(),
                    });
                }
                if m.weight().is_none() {
                    return Err(AdjustmentError::MissingCovariance(format!(
                        "measurement {j} of observation {}",
                        observation.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Residuals and partials of every measurement at the current parameters
    /// and ground points.
    ///
    /// Reads the models and observations only; the results go to `out`, which
    /// is cleared first.
    pub fn evaluate(
        &self,
        parameter_step: f64,
        ground_step_m: f64,
        out: &mut Evaluation,
    ) -> Result<(), AdjustmentError> {
        out.clear();
        let indices = self.measurement_indices();
        let mut by_image: Vec<Vec<(usize, GroundPoint)>> = vec![Vec::new(); self.images.len()];

        for (flat, &(k, j)) in indices.iter().enumerate() {
            let observation = &self.observations[k];
            let measurement = &observation.measurements[j];
            let model = self.images.get(measurement.image_index).ok_or(
                AdjustmentError::ImageIndexOutOfRange {
                    index: measurement.image_index,
                    images: self.images.len(),
                },
            )?;
            let ground = observation.ground_point;
            let residual = measurement.image_point - model.world_to_line_sample(&ground);
            let ground_partial = model.coordinate_forward_deriv(&ground, ground_step_m);
            let valid = residual.iter().chain(ground_partial.iter()).all(|v| v.is_finite());
            if !valid {
                warn!(
                    "observation {} cannot be projected into image {}",
                    observation.id, measurement.image_index
                );
            }
            out.residuals.push(residual);
            out.ground_partials.push(ground_partial);
            out.param_partials.push(DMatrix::zeros(
                2,
                model.number_of_adjustable_parameters(),
            ));
            out.valid.push(valid);
            if valid {
                by_image[measurement.image_index].push((flat, ground));
            }
        }

        for (i, model) in self.images.iter().enumerate() {
            let measured = &by_image[i];
            if measured.is_empty() {
                continue;
            }
            let store = model.adjustable_parameters();
            let values = store.values();
            for p in 0..store.number_of_parameters() {
                if store.is_locked(p)? {
                    continue;
                }
                let analytic: Option<Vec<Vector2<f64>>> = measured
                    .iter()
                    .map(|(_, g)| model.analytic_forward_deriv(p, g))
                    .collect();
                let column = match analytic {
                    Some(column) => column,
                    None => {
                        let mut plus = values.clone();
                        plus[p] += parameter_step;
                        let mut minus = values.clone();
                        minus[p] -= parameter_step;
                        let plus = model.with_parameters(&plus)?;
                        let minus = model.with_parameters(&minus)?;
                        measured
                            .iter()
                            .map(|(_, g)| {
                                (plus.world_to_line_sample(g) - minus.world_to_line_sample(g))
                                    / (2.0 * parameter_step)
                            })
                            .collect()
                    }
                };
                for ((flat, _), d) in measured.iter().zip(column) {
                    if d.iter().all(|v| v.is_finite()) {
                        out.param_partials[*flat].set_column(p, &d);
                    } else {
                        out.valid[*flat] = false;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{rpc, RpcModel};
    use approx::assert_relative_eq;

    fn two_image_set() -> ObservationSet<RpcModel> {
        let a = rpc::tests::sample_rpc();
        let mut b = rpc::tests::sample_rpc();
        b.set_adjustable_parameter(0, 0.02).unwrap();
        let ground = GroundPoint::new(40.01, -105.02, 1600.0);
        let pa = a.world_to_line_sample(&ground);
        let pb = pa + Vector2::new(0.0, 2.0);
        let mut set = ObservationSet::with_images(vec![a, b]);
        set.add_observation(
            Observation::new("gcp1", ground, 0.5)
                .with_measurement(Measurement::new(0, pa, 1.0))
                .with_measurement(Measurement::new(1, pb, 1.0)),
        )
        .unwrap();
        set
    }

    #[test]
    fn test_counts_and_layout() {
        let set = two_image_set();
        assert_eq!(set.num_images(), 2);
        assert_eq!(set.num_obs(), 1);
        assert_eq!(set.num_meas(), 2);
        assert_eq!(set.num_params(), 10);
        assert_eq!(set.rank(), 13);
        assert_eq!(set.parameter_offsets(), vec![0, 5]);
        assert_eq!(set.measurement_indices(), vec![(0, 0), (0, 1)]);
        assert_relative_eq!(set.measurement_covariance(0, 1).unwrap()[(0, 0)], 1.0);
        assert_relative_eq!(set.observation_covariance(0).unwrap()[(2, 2)], 0.25);
    }

    #[test]
    fn test_add_observation_checks_image_index() {
        let mut set = two_image_set();
        let bad = Observation::unknown("tp").with_measurement(Measurement::new(
            7,
            Vector2::new(1.0, 1.0),
            1.0,
        ));
        assert!(matches!(
            set.add_observation(bad),
            Err(AdjustmentError::ImageIndexOutOfRange { index: 7, images: 2 })
        ));
    }

    #[test]
    fn test_validate_rejects_degenerate_input() {
        let empty: ObservationSet<RpcModel> = ObservationSet::with_images(vec![rpc::tests::sample_rpc()]);
        assert!(matches!(
            empty.validate(),
            Err(AdjustmentError::EmptyObservationSet)
        ));

        let mut set = two_image_set();
        set.add_observation(Observation::unknown("lonely")).unwrap();
        assert!(matches!(
            set.validate(),
            Err(AdjustmentError::ObservationWithoutMeasurements(id)) if id == "lonely"
        ));

        let mut set = two_image_set();
        set.observations_mut()[0].measurements[0].covariance = Matrix2::zeros();
        assert!(matches!(
            set.validate(),
            Err(AdjustmentError::MissingCovariance(_))
        ));
    }

    #[test]
    fn test_evaluate_residuals_and_partials() {
        let set = two_image_set();
        let mut eval = Evaluation::new();
        set.evaluate(1e-4, 1.0, &mut eval).unwrap();
        assert_eq!(eval.len(), 2);
        assert!(eval.valid.iter().all(|v| *v));
        assert_relative_eq!(eval.residuals[0], Vector2::zeros(), epsilon = 1e-9);
        // Image 1 carries a 1-pixel line offset; the measurement is 2 pixels down.
        assert_relative_eq!(eval.residuals[1], Vector2::new(0.0, 1.0), epsilon = 1e-9);
        // Line offset partial is the parameter sigma.
        assert_relative_eq!(eval.param_partials[1][(1, 0)], 50.0, epsilon = 1e-9);
        assert_relative_eq!(eval.param_partials[1][(0, 0)], 0.0, epsilon = 1e-9);
        assert_eq!(eval.param_partials[0].shape(), (2, 5));
        assert!(eval.ground_partials[0].iter().all(|v| v.is_finite()));
        assert!(eval.ground_partials[0].norm() > 0.0);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let set = two_image_set();
        let mut first = Evaluation::new();
        let mut second = Evaluation::new();
        set.evaluate(1e-4, 1.0, &mut first).unwrap();
        set.evaluate(1e-4, 1.0, &mut second).unwrap();
        assert_eq!(first, second);
        // Reusing a buffer gives the same result too.
        set.evaluate(1e-4, 1.0, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_evaluate_skips_locked_parameters() {
        let mut set = two_image_set();
        set.image_mut(1).unwrap().set_parameter_locked(0, true).unwrap();
        let mut eval = Evaluation::new();
        set.evaluate(1e-4, 1.0, &mut eval).unwrap();
        assert_eq!(eval.param_partials[1][(1, 0)], 0.0);
    }

    #[test]
    fn test_unprojectable_measurement_is_flagged() {
        let mut set = two_image_set();
        set.add_observation(
            Observation::unknown("unseeded").with_measurement(Measurement::new(
                0,
                Vector2::new(10.0, 10.0),
                1.0,
            )),
        )
        .unwrap();
        let mut eval = Evaluation::new();
        set.evaluate(1e-4, 1.0, &mut eval).unwrap();
        assert_eq!(eval.valid, vec![true, true, false]);
    }
}
