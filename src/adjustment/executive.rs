use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::Vector3;

use super::observation::{Evaluation, ObservationSet};
use super::report::{
    ImageSummary, IterationSummary, ObservationSummary, ParameterSummary, ResidualRecord,
    SolutionSummary,
};
use super::solution::{NormalEquationState, SolutionStrategy};
use super::{AdjustmentError, BundleConfig, ExecutiveState, SolutionStatus};
use crate::geometry::{ConstantElevation, ElevationSource, GroundPoint};
use crate::sensor::SensorModel;
use crate::util::compute_error_statistics;

/// Both SEUW values below this count as converged regardless of their ratio.
const SEUW_FLOOR: f64 = 1e-9;

/// Drives a multi-image bundle adjustment.
///
/// ```text
/// Uninitialized --initialize_solution--> Initialized --run_solution--> Iterating
///     --> Finished(Converged | Diverged | MaxIterExceeded | Cancelled)
/// ```
///
/// The executive owns the [`ObservationSet`] (and with it every image model)
/// while it runs; take it back with [`BundleExecutive::into_observations`].
pub struct BundleExecutive<M: SensorModel + Clone> {
    config: BundleConfig,
    strategy: Box<dyn SolutionStrategy>,
    elevation: Option<Box<dyn ElevationSource>>,
    cancel: Option<Arc<AtomicBool>>,
    set: Option<ObservationSet<M>>,
    normal: Option<NormalEquationState>,
    evaluation: Evaluation,
    state: ExecutiveState,
    iterations: usize,
    seuw_history: Vec<f64>,
    iteration_log: Vec<IterationSummary>,
    initial_parameters: Vec<Vec<f64>>,
    initial_ground: Vec<GroundPoint>,
}

impl<M: SensorModel + Clone> BundleExecutive<M> {
    pub fn new(config: BundleConfig) -> Result<Self, AdjustmentError> {
        config.validate()?;
        let strategy = config.make_strategy();
        Ok(Self {
            config,
            strategy,
            elevation: None,
            cancel: None,
            set: None,
            normal: None,
            evaluation: Evaluation::new(),
            state: ExecutiveState::Uninitialized,
            iterations: 0,
            seuw_history: Vec::new(),
            iteration_log: Vec::new(),
            initial_parameters: Vec::new(),
            initial_ground: Vec::new(),
        })
    }

    /// Replaces the strategy chosen by the configuration.
    pub fn with_strategy(mut self, strategy: Box<dyn SolutionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Terrain used to seed unknown ground points. Without one, each image's
    /// reference height is used.
    pub fn with_elevation(mut self, elevation: Box<dyn ElevationSource>) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Flag polled between iterations; setting it ends the run as `Cancelled`.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn state(&self) -> ExecutiveState {
        self.state
    }

    /// Terminal status, once the run has finished.
    pub fn status(&self) -> Option<SolutionStatus> {
        match self.state {
            ExecutiveState::Finished(status) => Some(status),
            _ => None,
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// SEUW before the first iteration followed by one value per iteration.
    pub fn seuw_history(&self) -> &[f64] {
        &self.seuw_history
    }

    pub fn iteration_log(&self) -> &[IterationSummary] {
        &self.iteration_log
    }

    pub fn observations(&self) -> Option<&ObservationSet<M>> {
        self.set.as_ref()
    }

    pub fn normal_equations(&self) -> Option<&NormalEquationState> {
        self.normal.as_ref()
    }

    pub fn into_observations(self) -> Option<ObservationSet<M>> {
        self.set
    }

    /// Takes ownership of `set`, seeds unknown ground points and computes the
    /// initial SEUW.
    ///
    /// A set that fails validation is kept unmodified (retrievable with
    /// [`BundleExecutive::into_observations`]) and the executive stays
    /// uninitialized.
    pub fn initialize_solution(&mut self, mut set: ObservationSet<M>) -> Result<(), AdjustmentError> {
        self.state = ExecutiveState::Uninitialized;
        self.normal = None;
        self.iterations = 0;
        self.seuw_history.clear();
        self.iteration_log.clear();
        if let Err(e) = set.validate() {
            self.set = Some(set);
            return Err(e);
        }

        if let Err(e) = self.seed_ground_points(&mut set) {
            self.set = Some(set);
            return Err(e);
        }
        self.initial_parameters = set
            .images()
            .iter()
            .map(|m| m.adjustable_parameters().values())
            .collect();
        self.initial_ground = set.observations().iter().map(|o| o.ground_point).collect();

        let mut normal = NormalEquationState::new(&set)?;
        set.evaluate(
            self.config.parameter_derivative_step,
            self.config.ground_derivative_step_m,
            &mut self.evaluation,
        )?;
        normal.load_evaluation(&set, &self.evaluation)?;
        let seuw = normal.seuw();
        info!(
            "bundle initialized: {} images, {} observations, {} measurements, {} unknowns, SEUW {:.6}",
            set.num_images(),
            set.num_obs(),
            set.num_meas(),
            set.rank(),
            seuw
        );
        self.seuw_history.push(seuw);
        self.set = Some(set);
        self.normal = Some(normal);
        self.state = ExecutiveState::Initialized;
        Ok(())
    }

    /// Back-projects every measurement of an unset observation and averages the
    /// results in ECEF.
    fn seed_ground_points(&self, set: &mut ObservationSet<M>) -> Result<(), AdjustmentError> {
        let mut seeds = Vec::new();
        for (k, observation) in set.observations().iter().enumerate() {
            if !observation.is_ground_unset() {
                continue;
            }
            let mut sum = Vector3::zeros();
            let mut count = 0usize;
            for m in &observation.measurements {
                let model = set.image(m.image_index).ok_or(
                    AdjustmentError::ImageIndexOutOfRange {
                        index: m.image_index,
                        images: set.num_images(),
                    },
                )?;
                let ground = match &self.elevation {
                    Some(elevation) => model.line_sample_to_world(&m.image_point, elevation.as_ref()),
                    None => {
                        let reference =
                            ConstantElevation::new(model.geometry().reference_height());
                        model.line_sample_to_world(&m.image_point, &reference)
                    }
                };
                if ground.has_nan() {
                    continue;
                }
                sum += ground.to_ecef();
                count += 1;
            }
            if count == 0 {
                return Err(AdjustmentError::SeedFailed(observation.id.clone()));
            }
            let seed = GroundPoint::from_ecef(&(sum / count as f64));
            debug!(
                "seeded observation {} at ({:.8}, {:.8}, {:.3}) from {count} measurements",
                observation.id, seed.lat, seed.lon, seed.height
            );
            seeds.push((k, seed));
        }
        let observations = set.observations_mut();
        for (k, seed) in seeds {
            observations[k].ground_point = seed;
        }
        Ok(())
    }

    /// Iterates until the solution converges, diverges, runs out of iterations
    /// or is cancelled.
    pub fn run_solution(&mut self) -> Result<SolutionStatus, AdjustmentError> {
        if self.state != ExecutiveState::Initialized {
            return Err(AdjustmentError::NotInitialized);
        }
        let (Some(set), Some(normal)) = (self.set.as_mut(), self.normal.as_mut()) else {
            return Err(AdjustmentError::NotInitialized);
        };
        self.state = ExecutiveState::Iterating;

        let mut status = SolutionStatus::MaxIterExceeded;
        for iteration in 1..=self.config.max_iterations {
            if self
                .cancel
                .as_ref()
                .is_some_and(|c| c.load(Ordering::Relaxed))
            {
                info!("bundle cancelled before iteration {iteration}");
                status = SolutionStatus::Cancelled;
                break;
            }
            let found = set.num_params();
            if found != normal.num_params {
                return Err(AdjustmentError::MismatchedParameterCount {
                    expected: normal.num_params,
                    found,
                });
            }
            if self.config.trace_partials {
                for block in &normal.blocks {
                    debug!(
                        "partials image {} observation {}: params {} ground {}",
                        block.image_index,
                        block.observation_index,
                        block.param_partials,
                        block.ground_partials
                    );
                }
            }

            self.strategy.solve(normal, &self.config)?;
            if self.config.trace_corrections {
                debug!("corrections: {}", normal.last_corrections.transpose());
            }
            apply_corrections(set, normal)?;

            set.evaluate(
                self.config.parameter_derivative_step,
                self.config.ground_derivative_step_m,
                &mut self.evaluation,
            )?;
            normal.load_evaluation(set, &self.evaluation)?;
            let seuw = normal.seuw();
            self.seuw_history.push(seuw);
            self.iterations = iteration;

            let summary = iteration_summary(iteration, seuw, normal);
            if self.config.verbose {
                info!("{summary}");
            } else {
                debug!("{summary}");
            }
            self.iteration_log.push(summary);

            if is_diverging(&self.seuw_history) {
                warn!("bundle diverged at iteration {iteration}");
                status = SolutionStatus::Diverged;
                break;
            }
            if iteration > 1 && is_converged(&self.seuw_history, self.config.convergence_criteria) {
                status = SolutionStatus::Converged;
                break;
            }
        }
        info!(
            "bundle finished: {status} after {} iterations, SEUW {:.6}",
            self.iterations,
            self.seuw_history.last().copied().unwrap_or(f64::NAN)
        );
        self.state = ExecutiveState::Finished(status);
        Ok(status)
    }

    /// Report of the current solution. Posterior sigmas are only available
    /// after at least one iteration.
    pub fn summarize_solution(&self) -> Result<SolutionSummary, AdjustmentError> {
        let (Some(set), Some(normal)) = (self.set.as_ref(), self.normal.as_ref()) else {
            return Err(AdjustmentError::NotInitialized);
        };
        let seuw = self.seuw_history.last().copied().unwrap_or(f64::NAN);
        let covariance = normal.covariance.as_ref();
        let offsets = set.parameter_offsets();

        let mut images = Vec::with_capacity(set.num_images());
        for (i, model) in set.images().iter().enumerate() {
            let store = model.adjustable_parameters();
            let mut parameters = Vec::with_capacity(store.number_of_parameters());
            for (p, parameter) in store.parameters().iter().enumerate() {
                let u = offsets[i] + p;
                parameters.push(ParameterSummary {
                    description: parameter.description.clone(),
                    unit: parameter.unit.clone(),
                    initial_value: self.initial_parameters[i][p],
                    value: parameter.value,
                    offset: parameter.offset(),
                    sigma: parameter.sigma,
                    posterior_sigma: covariance
                        .filter(|_| !parameter.locked)
                        .map(|c| c[(u, u)].max(0.0).sqrt() * seuw * parameter.sigma),
                    locked: parameter.locked,
                });
            }
            images.push(ImageSummary {
                image_index: i,
                image_id: model.geometry().image_id.clone(),
                model_type: model.model_type().to_string(),
                parameters,
            });
        }

        let observations = set
            .observations()
            .iter()
            .enumerate()
            .map(|(k, o)| {
                let initial = self.initial_ground[k];
                let correction = initial.neu_to(&o.ground_point);
                let go = normal.ground_offset(k);
                ObservationSummary {
                    id: o.id.clone(),
                    initial_ground: initial,
                    ground: o.ground_point,
                    correction_m: [correction.x, correction.y, correction.z],
                    posterior_sigma_m: covariance.map(|c| {
                        [0, 1, 2].map(|a| c[(go + a, go + a)].max(0.0).sqrt() * seuw)
                    }),
                }
            })
            .collect();

        let standardized = normal.standardized_residuals();
        let residuals: Vec<ResidualRecord> = normal
            .blocks
            .iter()
            .zip(standardized)
            .map(|(b, e)| ResidualRecord {
                observation_id: set.observations()[b.observation_index].id.clone(),
                image_index: b.image_index,
                image_id: set
                    .image(b.image_index)
                    .map(|m| m.geometry().image_id.clone())
                    .unwrap_or_default(),
                sample_residual: b.residual.x,
                line_residual: b.residual.y,
                standardized: e,
                valid: b.valid,
            })
            .collect();
        let magnitudes: Vec<f64> = normal
            .blocks
            .iter()
            .filter(|b| b.valid)
            .map(|b| b.residual.norm())
            .collect();

        Ok(SolutionSummary {
            status: self.status(),
            iterations: self.iterations,
            seuw_history: self.seuw_history.clone(),
            degrees_of_freedom: normal.degrees_of_freedom(),
            num_images: set.num_images(),
            num_observations: set.num_obs(),
            num_measurements: set.num_meas(),
            num_parameters: set.num_params(),
            images,
            observations,
            residuals,
            residual_statistics: compute_error_statistics(&magnitudes).ok(),
            iteration_log: self.iteration_log.clone(),
        })
    }
}

/// Writes the last corrections into the image models (unlocked parameters
/// only) and the observations' ground points.
fn apply_corrections<M: SensorModel + Clone>(
    set: &mut ObservationSet<M>,
    normal: &NormalEquationState,
) -> Result<(), AdjustmentError> {
    let offsets = set.parameter_offsets();
    for (i, offset) in offsets.into_iter().enumerate() {
        let Some(model) = set.image_mut(i) else {
            continue;
        };
        let store = model.adjustable_parameters();
        let mut values = store.values();
        let mut changed = false;
        for (p, value) in values.iter_mut().enumerate() {
            if store.is_locked(p)? {
                continue;
            }
            let dx = normal.last_corrections[offset + p];
            if dx != 0.0 {
                *value += dx;
                changed = true;
            }
        }
        if changed {
            model.set_adjustable_parameters(&values)?;
        }
    }
    for (k, observation) in set.observations_mut().iter_mut().enumerate() {
        let d = normal.ground_correction(k);
        observation.ground_point = observation.ground_point.offset_neu(&d);
    }
    Ok(())
}

fn iteration_summary(iteration: usize, seuw: f64, normal: &NormalEquationState) -> IterationSummary {
    let max_parameter_correction = normal
        .last_corrections
        .rows(0, normal.num_params)
        .iter()
        .fold(0.0_f64, |m, v| m.max(v.abs()));
    let max_ground_correction_m = (0..normal.num_obs)
        .map(|k| normal.ground_correction(k).norm())
        .fold(0.0_f64, f64::max);
    let valid: Vec<f64> = normal
        .blocks
        .iter()
        .filter(|b| b.valid)
        .map(|b| b.residual.norm_squared())
        .collect();
    let residual_rms_px = if valid.is_empty() {
        f64::NAN
    } else {
        (valid.iter().sum::<f64>() / valid.len() as f64).sqrt()
    };
    IterationSummary {
        iteration,
        seuw,
        max_parameter_correction,
        max_ground_correction_m,
        residual_rms_px,
    }
}

/// Three consecutive strict increases ending at the latest value.
fn is_diverging(history: &[f64]) -> bool {
    let n = history.len();
    n >= 4
        && history[n - 1] > history[n - 2]
        && history[n - 2] > history[n - 3]
        && history[n - 3] > history[n - 4]
}

/// Relative change of the last two values, in percent, within `criteria`.
fn is_converged(history: &[f64], criteria: f64) -> bool {
    let n = history.len();
    if n < 2 {
        return false;
    }
    let (previous, current) = (history[n - 2], history[n - 1]);
    if previous < SEUW_FLOOR && current < SEUW_FLOOR {
        return true;
    }
    (previous - current).abs() / previous * 100.0 <= criteria
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjustment::observation::{Measurement, Observation};
    use crate::sensor::{rpc, RpcModel};
    use approx::assert_relative_eq;

    #[test]
    fn test_divergence_needs_three_increases() {
        assert!(!is_diverging(&[1.0, 2.0, 3.0]));
        assert!(is_diverging(&[1.0, 2.0, 3.0, 4.0]));
        assert!(!is_diverging(&[1.0, 2.0, 2.0, 4.0]));
        assert!(!is_diverging(&[5.0, 1.0, 2.0, 3.0]));
        assert!(is_diverging(&[5.0, 1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_convergence_criteria() {
        assert!(!is_converged(&[1.0], 0.1));
        assert!(is_converged(&[1.0, 0.9995], 0.1));
        assert!(!is_converged(&[1.0, 0.99], 0.1));
        assert!(is_converged(&[1e-12, 1e-13], 0.1));
    }

    fn offset_scenario() -> ObservationSet<RpcModel> {
        let truth = rpc::tests::sample_rpc();
        let mut a = truth.clone();
        let mut b = truth.clone();
        b.set_adjustable_parameter(0, 0.02).unwrap();
        for p in 0..5 {
            a.set_parameter_locked(p, true).unwrap();
            if p != 0 {
                b.set_parameter_locked(p, true).unwrap();
            }
        }
        let mut set = ObservationSet::with_images(vec![a, b]);
        for (n, (lat, lon)) in [(40.01, -105.01), (39.99, -104.99), (40.02, -104.98)]
            .into_iter()
            .enumerate()
        {
            let ground = GroundPoint::new(lat, lon, 1500.0);
            let p = truth.world_to_line_sample(&ground);
            set.add_observation(
                Observation::new(&format!("gcp{n}"), ground, 0.01)
                    .with_measurement(Measurement::new(0, p, 1.0))
                    .with_measurement(Measurement::new(1, p, 1.0)),
            )
            .unwrap();
        }
        set
    }

    #[test]
    fn test_run_before_initialize_fails() {
        let mut executive: BundleExecutive<RpcModel> =
            BundleExecutive::new(BundleConfig::default()).unwrap();
        assert!(matches!(
            executive.run_solution(),
            Err(AdjustmentError::NotInitialized)
        ));
        assert!(executive.summarize_solution().is_err());
    }

    #[test]
    fn test_removes_image_offset() {
        let mut executive = BundleExecutive::new(BundleConfig::default()).unwrap();
        executive.initialize_solution(offset_scenario()).unwrap();
        assert_eq!(executive.state(), ExecutiveState::Initialized);
        let status = executive.run_solution().unwrap();
        assert_eq!(status, SolutionStatus::Converged);
        assert!(executive.iterations() <= 3);

        let set = executive.observations().unwrap();
        let b = set.image(1).unwrap();
        assert_relative_eq!(b.adjustable_parameters().value(0).unwrap(), 0.0, epsilon = 1e-3);
        assert_eq!(set.image(0).unwrap().adjustable_parameters().values(), vec![0.0; 5]);

        let summary = executive.summarize_solution().unwrap();
        assert_eq!(summary.status, Some(SolutionStatus::Converged));
        assert_eq!(summary.residuals.len(), 6);
        assert!(summary.images[1].parameters[0].posterior_sigma.is_some());
        assert!(summary.images[1].parameters[1].posterior_sigma.is_none());
        assert!(summary.residual_statistics.unwrap().max < 0.1);
        assert!(summary.to_string().contains("Converged"));
    }

    #[test]
    fn test_unknown_ground_is_seeded() {
        let truth = rpc::tests::sample_rpc();
        let ground = GroundPoint::new(40.005, -105.005, 1500.0);
        let p = truth.world_to_line_sample(&ground);
        let mut set = ObservationSet::with_images(vec![truth.clone(), truth]);
        set.add_observation(
            Observation::unknown("tp")
                .with_measurement(Measurement::new(0, p, 1.0))
                .with_measurement(Measurement::new(1, p, 1.0)),
        )
        .unwrap();
        let mut executive = BundleExecutive::new(BundleConfig::default()).unwrap();
        executive.initialize_solution(set).unwrap();
        let seeded = executive.observations().unwrap().observations()[0].ground_point;
        assert!(!seeded.has_nan());
        // Seeded at the reference height, which matches the truth here.
        assert!(seeded.distance_to(&ground) < 1.0);
    }

    #[test]
    fn test_cancel_before_first_iteration() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut executive = BundleExecutive::new(BundleConfig::default())
            .unwrap()
            .with_cancel_flag(flag);
        executive.initialize_solution(offset_scenario()).unwrap();
        assert_eq!(executive.run_solution().unwrap(), SolutionStatus::Cancelled);
        assert_eq!(executive.iterations(), 0);
        assert_eq!(executive.seuw_history().len(), 1);
    }
}
