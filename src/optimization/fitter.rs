//! Single-model self-calibration by Levenberg-Marquardt.
//!
//! Residuals are `observed - predicted` in the configured [`ResidualSpace`];
//! the Jacobian holds `d predicted / d value` for every free adjustable
//! parameter, in normalized parameter units. Damping follows Nielsen's rule:
//! it starts at `initial_damping_scale * max(diag(JᵀJ))`, shrinks by
//! `max(1/3, 1 - (2ρ - 1)³)` after an accepted step and grows geometrically by
//! `damping_speed` after every rejected one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use super::{FitConfig, FitError, FitReport, Optimizer, ResidualSpace, TiePoint};
use crate::geometry::GroundPoint;
use crate::linalg::{
    decompose_symmetric, solve_least_squares, solve_symmetric, LinAlgError,
    DEFAULT_RANK_TOLERANCE,
};
use crate::sensor::{SensorModel, SensorModelError};
use crate::util::{compute_reprojection_error, ProjectionError};

/// Fits the free adjustable parameters of one sensor model to tie points.
///
/// The fitter owns the model for the duration of the solve; get it back with
/// [`ModelFitter::into_model`].
#[derive(Debug, Clone)]
pub struct ModelFitter<M> {
    model: M,
    tie_points: Vec<TiePoint>,
    config: FitConfig,
    cancel: Option<Arc<AtomicBool>>,
    last_report: Option<FitReport>,
}

impl<M: SensorModel + Clone> ModelFitter<M> {
    pub fn new(model: M, tie_points: Vec<TiePoint>, config: FitConfig) -> Self {
        Self {
            model,
            tie_points,
            config,
            cancel: None,
            last_report: None,
        }
    }

    /// Flag polled between iterations; setting it stops the fit early.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn tie_points(&self) -> &[TiePoint] {
        &self.tie_points
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn last_report(&self) -> Option<&FitReport> {
        self.last_report.as_ref()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn tie_height(model: &M, tie: &TiePoint) -> f64 {
        if tie.ground_point.height.is_finite() {
            tie.ground_point.height
        } else {
            model.geometry().reference_height()
        }
    }

    fn observations(&self) -> DVector<f64> {
        let space = self.config.residual_space;
        let rows = space.rows_per_point();
        let mut obs = DVector::zeros(self.tie_points.len() * rows);
        for (k, tie) in self.tie_points.iter().enumerate() {
            match space {
                ResidualSpace::Image => {
                    obs[k * 2] = tie.image_point.x;
                    obs[k * 2 + 1] = tie.image_point.y;
                }
                // The back-projected point should coincide with the ground point.
                ResidualSpace::Ground => {}
                ResidualSpace::Height => obs[k] = tie.ground_point.height,
            }
        }
        obs
    }

    /// Model predictions matching the layout of [`Self::observations`].
    fn predictions(&self, model: &M) -> Result<DVector<f64>, FitError> {
        let space = self.config.residual_space;
        let rows = space.rows_per_point();
        let mut pred = DVector::zeros(self.tie_points.len() * rows);
        for (k, tie) in self.tie_points.iter().enumerate() {
            match space {
                ResidualSpace::Image => {
                    let p = model.world_to_line_sample(&tie.ground_point);
                    pred[k * 2] = p.x;
                    pred[k * 2 + 1] = p.y;
                }
                ResidualSpace::Ground => {
                    let height = Self::tie_height(model, tie);
                    let g = model.line_sample_height_to_world(&tie.image_point, height);
                    let neu = tie.ground_point.neu_to(&g);
                    pred[k * 2] = neu.x;
                    pred[k * 2 + 1] = neu.y;
                }
                ResidualSpace::Height => {
                    let ray = model
                        .imaging_ray(&tie.image_point)
                        .ok_or(SensorModelError::RayMissesEllipsoid)?;
                    let ellipsoid = &model.geometry().ellipsoid;
                    let target = ellipsoid.geodetic_to_ecef(
                        tie.ground_point.lat,
                        tie.ground_point.lon,
                        Self::tie_height(model, tie),
                    );
                    let closest = ray.closest_point_to(&target);
                    pred[k] = GroundPoint::from_ecef_with(&closest, ellipsoid).height;
                }
            }
        }
        if pred.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NumericalError(
                "sensor model could not project every tie point".to_string(),
            ));
        }
        Ok(pred)
    }

    /// `observed - predicted` at `model`.
    pub fn residuals(&self, model: &M) -> Result<DVector<f64>, FitError> {
        Ok(self.observations() - self.predictions(model)?)
    }

    /// `d predicted / d value` for the parameters in `free`.
    ///
    /// Image-space columns use the model's analytic partials when it has them
    /// for every tie point; everything else is a centered difference.
    pub fn jacobian(&self, model: &M, free: &[usize]) -> Result<DMatrix<f64>, FitError> {
        let rows = self.tie_points.len() * self.config.residual_space.rows_per_point();
        let mut jacobian = DMatrix::zeros(rows, free.len());
        let step = self.config.derivative_step;
        let values = model.adjustable_parameters().values();

        for (col, &index) in free.iter().enumerate() {
            if self.config.residual_space == ResidualSpace::Image {
                let analytic: Option<Vec<_>> = self
                    .tie_points
                    .iter()
                    .map(|tie| model.analytic_forward_deriv(index, &tie.ground_point))
                    .collect();
                if let Some(partials) = analytic {
                    for (k, d) in partials.iter().enumerate() {
                        jacobian[(k * 2, col)] = d.x;
                        jacobian[(k * 2 + 1, col)] = d.y;
                    }
                    continue;
                }
            }
            let mut plus = values.clone();
            plus[index] += step;
            let mut minus = values.clone();
            minus[index] -= step;
            let p = self.predictions(&model.with_parameters(&plus)?)?;
            let m = self.predictions(&model.with_parameters(&minus)?)?;
            jacobian.set_column(col, &((p - m) / (2.0 * step)));
        }
        Ok(jacobian)
    }

    /// Splits `free` into observable and unobservable parameters by Jacobian column energy.
    fn screen_observability(
        &self,
        jacobian: &DMatrix<f64>,
        free: &[usize],
    ) -> (Vec<usize>, Vec<usize>) {
        let energies: Vec<f64> = jacobian
            .column_iter()
            .map(|c| c.norm_squared())
            .collect();
        let strongest = energies
            .iter()
            .copied()
            .filter(|e| e.is_finite())
            .fold(0.0, f64::max);
        let mut observable = Vec::new();
        let mut unobservable = Vec::new();
        for (&index, &energy) in free.iter().zip(&energies) {
            if energy.is_finite()
                && energy > 0.0
                && energy > self.config.unobservable_tolerance * strongest
            {
                observable.push(index);
            } else {
                unobservable.push(index);
            }
        }
        (observable, unobservable)
    }

    /// Free parameters that the tie points can actually determine.
    fn observable_parameters(&self) -> Result<(Vec<usize>, Vec<usize>), FitError> {
        let free = self.model.adjustable_parameters().free_indices();
        if free.is_empty() {
            return Ok((free, Vec::new()));
        }
        let jacobian = self.jacobian(&self.model, &free)?;
        let (observable, unobservable) = self.screen_observability(&jacobian, &free);
        if let Some(&index) = unobservable.first() {
            if !self.config.auto_lock_unobservable || observable.is_empty() {
                let description = self
                    .model
                    .adjustable_parameters()
                    .parameter(index)?
                    .description
                    .clone();
                return Err(FitError::UnobservableParameter { index, description });
            }
            warn!(
                "{}: excluding unobservable parameters {:?} from this fit",
                self.model.geometry().image_id,
                unobservable
            );
        }
        Ok((observable, unobservable))
    }

    /// Runs Levenberg-Marquardt until convergence, cancellation or the iteration cap.
    pub fn fit(&mut self) -> Result<FitReport, FitError> {
        if self.tie_points.is_empty() {
            return Err(FitError::NoObservations);
        }
        self.config.validate()?;
        let verbose = self.config.verbose;
        let (free, unobservable) = self.observable_parameters()?;

        let rows = self.observations().len();
        let mut r = self.residuals(&self.model)?;
        let mut cost = 0.5 * r.norm_squared();
        let initial_rms = (r.norm_squared() / rows as f64).sqrt();
        let mut values = self.model.adjustable_parameters().values();

        let mut report = FitReport {
            iterations: 0,
            converged: false,
            cancelled: false,
            initial_rms,
            final_rms: initial_rms,
            variance: r.norm_squared() / rows.saturating_sub(free.len()).max(1) as f64,
            unobservable_parameters: unobservable,
            parameter_values: values.clone(),
        };
        if free.is_empty() {
            report.converged = true;
            self.last_report = Some(report.clone());
            return Ok(report);
        }

        let mut jacobian = self.jacobian(&self.model, &free)?;
        let mut normal = jacobian.tr_mul(&jacobian);
        let mut gradient = jacobian.tr_mul(&r);
        let decomposition = decompose_symmetric(&normal, DEFAULT_RANK_TOLERANCE)?;
        if !decomposition.is_full_rank() {
            return Err(LinAlgError::RankDeficient {
                rank: decomposition.rank,
                size: decomposition.size(),
            }
            .into());
        }

        let max_diagonal = normal.diagonal().iter().copied().fold(0.0, f64::max);
        let mut damping = self.config.initial_damping_scale * max_diagonal;
        let mut nu = self.config.damping_speed;

        if verbose {
            info!(
                "{}: fitting {} parameters to {} tie points, initial rms {:.6e}",
                self.model.geometry().image_id,
                free.len(),
                self.tie_points.len(),
                initial_rms
            );
        }

        while report.iterations < self.config.max_iterations {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if r.norm_squared() / rows as f64 <= self.config.min_residual {
                report.converged = true;
                break;
            }
            report.iterations += 1;

            let mut damped = normal.clone();
            for k in 0..free.len() {
                damped[(k, k)] += damping;
            }
            let delta = solve_symmetric(&damped, &gradient, DEFAULT_RANK_TOLERANCE)?;
            let free_norm = free.iter().map(|&i| values[i].powi(2)).sum::<f64>().sqrt();
            if delta.norm() <= self.config.min_delta * (free_norm + self.config.min_delta) {
                report.converged = true;
                break;
            }

            let mut trial = values.clone();
            for (k, &index) in free.iter().enumerate() {
                trial[index] += delta[k];
            }
            let candidate = self.model.with_parameters(&trial)?;
            let predicted = 0.5 * delta.dot(&(&delta * damping + &gradient));
            let evaluated = self
                .residuals(&candidate)
                .ok()
                .map(|r_new| (0.5 * r_new.norm_squared(), r_new));

            match evaluated {
                Some((new_cost, r_new)) if predicted > 0.0 && new_cost < cost => {
                    let rho = (cost - new_cost) / predicted;
                    self.model = candidate;
                    values = trial;
                    r = r_new;
                    cost = new_cost;
                    jacobian = self.jacobian(&self.model, &free)?;
                    normal = jacobian.tr_mul(&jacobian);
                    gradient = jacobian.tr_mul(&r);
                    damping *= (1.0 / 3.0_f64).max(1.0 - (2.0 * rho - 1.0).powi(3));
                    nu = self.config.damping_speed;
                    if verbose {
                        info!(
                            "Iteration {}: cost = {:.6e}, damping = {:.6e}, step_norm = {:.6e}, rho = {:.3} [ACCEPTED]",
                            report.iterations,
                            cost,
                            damping,
                            delta.norm(),
                            rho
                        );
                    }
                }
                _ => {
                    damping *= nu;
                    nu *= self.config.damping_speed;
                    if verbose {
                        debug!(
                            "Iteration {}: damping = {:.6e}, step_norm = {:.6e} [REJECTED]",
                            report.iterations,
                            damping,
                            delta.norm()
                        );
                    }
                    if !damping.is_finite() {
                        break;
                    }
                }
            }
        }

        if !report.converged && r.norm_squared() / rows as f64 <= self.config.min_residual {
            report.converged = true;
        }
        report.final_rms = (r.norm_squared() / rows as f64).sqrt();
        report.variance = r.norm_squared() / rows.saturating_sub(free.len()).max(1) as f64;
        report.parameter_values = values;
        if verbose {
            info!(
                "{}: fit finished after {} iterations, rms {:.6e} -> {:.6e}, variance {:.6e}",
                self.model.geometry().image_id,
                report.iterations,
                report.initial_rms,
                report.final_rms,
                report.variance
            );
        }
        self.last_report = Some(report.clone());
        Ok(report)
    }
}

impl<M: SensorModel + Clone> Optimizer for ModelFitter<M> {
    fn optimize(&mut self, verbose: bool) -> Result<(), FitError> {
        self.config.verbose = verbose;
        self.fit().map(|_| ())
    }

    /// One undamped Gauss-Newton step from the current parameters.
    fn linear_estimation(&mut self) -> Result<(), FitError>
    where
        Self: Sized,
    {
        if self.tie_points.is_empty() {
            return Err(FitError::NoObservations);
        }
        let (free, _) = self.observable_parameters()?;
        if free.is_empty() {
            return Ok(());
        }
        let r = self.residuals(&self.model)?;
        let jacobian = self.jacobian(&self.model, &free)?;
        let delta = solve_least_squares(&jacobian, &r, DEFAULT_RANK_TOLERANCE)?;
        let mut values = self.model.adjustable_parameters().values();
        for (k, &index) in free.iter().enumerate() {
            values[index] += delta[k];
        }
        self.model.set_adjustable_parameters(&values)?;
        Ok(())
    }

    fn fit_error(&self) -> Result<ProjectionError, FitError> {
        let ground: Vec<_> = self.tie_points.iter().map(|t| t.ground_point).collect();
        let image: Vec<_> = self.tie_points.iter().map(|t| t.image_point).collect();
        Ok(compute_reprojection_error(&self.model, &ground, &image)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::sample_image_grid;
    use crate::sensor::{frame, rpc};
    use approx::assert_relative_eq;

    fn tie_points_from<M: SensorModel>(truth: &M, heights: &[f64]) -> Vec<TiePoint> {
        let rect = *truth.image_clip_rect();
        let mut ties = Vec::new();
        for (k, p) in sample_image_grid(&rect, 25).into_iter().enumerate() {
            let h = heights[k % heights.len()];
            let g = truth.line_sample_height_to_world(&p, h);
            ties.push(TiePoint::new(p, g));
        }
        ties
    }

    #[test]
    fn test_fit_recovers_rpc_parameters() {
        let mut truth = rpc::tests::sample_rpc();
        let expected = [0.2, -0.3, 0.1, -0.05, 0.5];
        truth.set_adjustable_parameters(&expected).unwrap();
        let ties = tie_points_from(&truth, &[1200.0, 1500.0, 1800.0]);

        let mut fitter = ModelFitter::new(rpc::tests::sample_rpc(), ties, FitConfig::default());
        let report = fitter.fit().unwrap();
        assert!(report.converged, "{report:?}");
        assert!(report.final_rms < 1e-4, "{report:?}");
        assert!(report.initial_rms > 1.0);
        for (v, e) in report.parameter_values.iter().zip(expected) {
            assert_relative_eq!(*v, e, epsilon = 1e-5);
        }
        let stats = fitter.fit_error().unwrap();
        assert!(stats.max < 1e-3, "{stats:?}");
    }

    #[test]
    fn test_fit_frame_attitude_in_ground_space() {
        let mut truth = frame::tests::sample_frame();
        truth.set_adjustable_parameters(&[0.5, -0.4, 0.3, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let ties = tie_points_from(&truth, &[1400.0, 1500.0, 1650.0]);

        let mut model = frame::tests::sample_frame();
        for index in 3..7 {
            model.set_parameter_locked(index, true).unwrap();
        }
        let config = FitConfig {
            residual_space: ResidualSpace::Ground,
            ..FitConfig::default()
        };
        let mut fitter = ModelFitter::new(model, ties, config);
        let report = fitter.fit().unwrap();
        assert!(report.final_rms < 1e-3, "{report:?}");
        assert_relative_eq!(report.parameter_values[0], 0.5, epsilon = 1e-4);
        assert_relative_eq!(report.parameter_values[1], -0.4, epsilon = 1e-4);
        assert_relative_eq!(report.parameter_values[2], 0.3, epsilon = 1e-4);
        assert_eq!(&report.parameter_values[3..], &[0.0; 4]);
    }

    #[test]
    fn test_fit_without_tie_points_fails_fast() {
        let mut fitter = ModelFitter::new(rpc::tests::sample_rpc(), Vec::new(), FitConfig::default());
        assert!(matches!(fitter.fit(), Err(FitError::NoObservations)));
        assert!(fitter.last_report().is_none());
    }

    fn single_center_tie() -> (Vec<TiePoint>, [f64; 5]) {
        let mut truth = rpc::tests::sample_rpc();
        let expected = [0.1, -0.2, 0.0, 0.0, 0.0];
        truth.set_adjustable_parameters(&expected).unwrap();
        let ground = GroundPoint::new(40.0, -105.0, 1500.0);
        let tie = TiePoint::new(truth.world_to_line_sample(&ground), ground);
        (vec![tie], expected)
    }

    #[test]
    fn test_unobservable_parameters_are_excluded() {
        let (ties, expected) = single_center_tie();
        let mut fitter = ModelFitter::new(rpc::tests::sample_rpc(), ties, FitConfig::default());
        let report = fitter.fit().unwrap();
        assert_eq!(report.unobservable_parameters, vec![2, 3, 4]);
        assert_relative_eq!(report.parameter_values[0], expected[0], epsilon = 1e-6);
        assert_relative_eq!(report.parameter_values[1], expected[1], epsilon = 1e-6);
        assert_eq!(&report.parameter_values[2..], &[0.0; 3]);
    }

    #[test]
    fn test_unobservable_parameter_is_reported() {
        let (ties, _) = single_center_tie();
        let config = FitConfig {
            auto_lock_unobservable: false,
            ..FitConfig::default()
        };
        let mut fitter = ModelFitter::new(rpc::tests::sample_rpc(), ties, config);
        match fitter.fit() {
            Err(FitError::UnobservableParameter { index, description }) => {
                assert_eq!(index, 2);
                assert_eq!(description, "intrack_scale");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_fit_stops_before_iterating() {
        let mut truth = rpc::tests::sample_rpc();
        truth.set_adjustable_parameter(0, 0.5).unwrap();
        let ties = tie_points_from(&truth, &[1500.0]);
        let flag = Arc::new(AtomicBool::new(true));
        let mut fitter = ModelFitter::new(rpc::tests::sample_rpc(), ties, FitConfig::default())
            .with_cancel_flag(flag);
        let report = fitter.fit().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(fitter.model().adjustable_parameters().values(), vec![0.0; 5]);
    }

    #[test]
    fn test_linear_estimation_solves_offsets_in_one_step() {
        let mut truth = rpc::tests::sample_rpc();
        truth.set_adjustable_parameters(&[0.4, -0.1, 0.0, 0.0, 0.0]).unwrap();
        let ties = tie_points_from(&truth, &[1300.0, 1700.0]);
        let mut model = rpc::tests::sample_rpc();
        for index in 2..5 {
            model.set_parameter_locked(index, true).unwrap();
        }
        let mut fitter = ModelFitter::new(model, ties, FitConfig::default());
        fitter.linear_estimation().unwrap();
        let values = fitter.model().adjustable_parameters().values();
        assert_relative_eq!(values[0], 0.4, epsilon = 1e-9);
        assert_relative_eq!(values[1], -0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_height_residuals_vanish_for_exact_model() {
        let truth = frame::tests::sample_frame();
        let ties = tie_points_from(&truth, &[1500.0, 1600.0]);
        let config = FitConfig {
            residual_space: ResidualSpace::Height,
            ..FitConfig::default()
        };
        let fitter = ModelFitter::new(truth, ties, config);
        let r = fitter.residuals(fitter.model()).unwrap();
        assert_eq!(r.len(), 25);
        assert!(r.amax() < 1e-3, "{r}");
    }

    #[test]
    fn test_fit_config_from_yaml() {
        let config = FitConfig::from_yaml_file("samples/fit_config.yaml").unwrap();
        assert_eq!(config.residual_space, ResidualSpace::Ground);
        assert_eq!(config.max_iterations, 50);
        assert_relative_eq!(config.derivative_step, 1e-4);
        assert!(FitConfig::from_yaml_file("samples/missing.yaml").is_err());
    }
}
