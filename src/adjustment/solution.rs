//! Normal equations of the bundle and the strategies that solve them.

use std::fmt::Debug;

use log::debug;
use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};

use super::observation::{Evaluation, ObservationSet};
use super::{AdjustmentError, BundleConfig};
use crate::linalg::{invert_symmetric, solve_symmetric};
use crate::sensor::SensorModel;

/// Linearized contribution of one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementBlock {
    pub image_index: usize,
    pub observation_index: usize,
    /// Index of the image's first parameter in the unknown vector.
    pub param_offset: usize,
    pub param_partials: DMatrix<f64>,
    pub ground_partials: Matrix2x3<f64>,
    pub residual: Vector2<f64>,
    /// Inverse measurement covariance.
    pub weight: Matrix2<f64>,
    pub valid: bool,
}

impl MeasurementBlock {
    /// `r^T W r`.
    pub fn weighted_square(&self) -> f64 {
        (self.residual.transpose() * self.weight * self.residual)[(0, 0)]
    }
}

/// Everything one iteration needs to form and solve `N dx = b`.
///
/// Parameters are in normalized units (one unit is one a-priori sigma), ground
/// corrections in local `(north, east, up)` meters.
#[derive(Debug, Clone)]
pub struct NormalEquationState {
    pub num_params: usize,
    pub num_obs: usize,
    pub rank: usize,
    pub normal: DMatrix<f64>,
    pub rhs: DVector<f64>,
    pub last_corrections: DVector<f64>,
    /// Sum of all corrections applied since initialization.
    pub total_corrections: DVector<f64>,
    /// Inverse of the last solved normal matrix.
    pub covariance: Option<DMatrix<f64>>,
    pub blocks: Vec<MeasurementBlock>,
    /// Prior weight of each parameter.
    pub parameter_prior: Vec<f64>,
    /// Inverse a-priori ground covariance of each observation.
    pub ground_prior: Vec<Matrix3<f64>>,
    pub locked: Vec<bool>,
}

impl NormalEquationState {
    pub fn new<M: SensorModel + Clone>(
        set: &ObservationSet<M>,
    ) -> Result<Self, AdjustmentError> {
        let num_params = set.num_params();
        let num_obs = set.num_obs();
        let rank = set.rank();
        let mut locked = Vec::with_capacity(num_params);
        for model in set.images() {
            let store = model.adjustable_parameters();
            for p in 0..store.number_of_parameters() {
                locked.push(store.is_locked(p)?);
            }
        }
        let ground_prior = set
            .observations()
            .iter()
            .map(|o| {
                o.ground_weight().ok_or_else(|| {
                    AdjustmentError::MissingCovariance(format!(
                        "ground covariance of observation {}",
                        o.id
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            num_params,
            num_obs,
            rank,
            normal: DMatrix::zeros(rank, rank),
            rhs: DVector::zeros(rank),
            last_corrections: DVector::zeros(rank),
            total_corrections: DVector::zeros(rank),
            covariance: None,
            blocks: Vec::new(),
            parameter_prior: vec![1.0; num_params],
            ground_prior,
            locked,
        })
    }

    /// Index of observation `k`'s north correction in the unknown vector.
    pub fn ground_offset(&self, observation: usize) -> usize {
        self.num_params + 3 * observation
    }

    pub fn ground_correction(&self, observation: usize) -> Vector3<f64> {
        let o = self.ground_offset(observation);
        Vector3::new(
            self.last_corrections[o],
            self.last_corrections[o + 1],
            self.last_corrections[o + 2],
        )
    }

    fn total_ground_correction(&self, observation: usize) -> Vector3<f64> {
        let o = self.ground_offset(observation);
        Vector3::new(
            self.total_corrections[o],
            self.total_corrections[o + 1],
            self.total_corrections[o + 2],
        )
    }

    /// Replaces the measurement blocks with a fresh evaluation.
    pub fn load_evaluation<M: SensorModel + Clone>(
        &mut self,
        set: &ObservationSet<M>,
        evaluation: &Evaluation,
    ) -> Result<(), AdjustmentError> {
        let offsets = set.parameter_offsets();
        self.blocks.clear();
        for (flat, (k, j)) in set.measurement_indices().into_iter().enumerate() {
            let measurement = &set.observations()[k].measurements[j];
            let weight = measurement.weight().ok_or_else(|| {
                AdjustmentError::MissingCovariance(format!(
                    "measurement {j} of observation {}",
                    set.observations()[k].id
                ))
            })?;
            self.blocks.push(MeasurementBlock {
                image_index: measurement.image_index,
                observation_index: k,
                param_offset: offsets[measurement.image_index],
                param_partials: evaluation.param_partials[flat].clone(),
                ground_partials: evaluation.ground_partials[flat],
                residual: evaluation.residuals[flat],
                weight,
                valid: evaluation.valid[flat],
            });
        }
        Ok(())
    }

    /// Forms `N` and `b` from the blocks and the priors.
    ///
    /// `scales`, when given, multiplies each block's weight. Locked parameters
    /// end up with an identity row and a zero right-hand side.
    pub fn assemble(&mut self, scales: Option<&[f64]>) {
        let n = self.rank;
        let mut normal = DMatrix::zeros(n, n);
        let mut rhs = DVector::zeros(n);

        for (b, block) in self.blocks.iter().enumerate() {
            if !block.valid {
                continue;
            }
            let scale = scales.and_then(|s| s.get(b).copied()).unwrap_or(1.0);
            let w = block.weight * scale;
            let ap = &block.param_partials;
            let ag = &block.ground_partials;
            let po = block.param_offset;
            let np = ap.ncols();
            let go = self.ground_offset(block.observation_index);

            let ap_w = ap.transpose() * w;
            let ag_w = ag.transpose() * w;

            let npp = &ap_w * ap;
            let npg = &ap_w * ag;
            let ngg = ag_w * ag;
            let mut view = normal.view_mut((po, po), (np, np));
            view += &npp;
            let mut view = normal.view_mut((po, go), (np, 3));
            view += &npg;
            let mut view = normal.view_mut((go, po), (3, np));
            view += npg.transpose();
            let mut view = normal.view_mut((go, go), (3, 3));
            view += ngg;

            let bp = &ap_w * block.residual;
            let bg = ag_w * block.residual;
            let mut view = rhs.rows_mut(po, np);
            view += &bp;
            let mut view = rhs.rows_mut(go, 3);
            view += bg;
        }

        for (i, w) in self.parameter_prior.iter().enumerate() {
            normal[(i, i)] += w;
            rhs[i] -= w * self.total_corrections[i];
        }
        for k in 0..self.num_obs {
            let go = self.ground_offset(k);
            let wg = self.ground_prior[k];
            let mut view = normal.view_mut((go, go), (3, 3));
            view += wg;
            let prior = wg * self.total_ground_correction(k);
            let mut view = rhs.rows_mut(go, 3);
            view -= prior;
        }

        for (i, locked) in self.locked.iter().enumerate() {
            if *locked {
                normal.row_mut(i).fill(0.0);
                normal.column_mut(i).fill(0.0);
                normal[(i, i)] = 1.0;
                rhs[i] = 0.0;
            }
        }

        self.normal = normal;
        self.rhs = rhs;
    }

    /// Sum of weighted squared measurement residuals plus the prior terms.
    pub fn weighted_residual_sum(&self) -> f64 {
        let measurements: f64 = self
            .blocks
            .iter()
            .filter(|b| b.valid)
            .map(MeasurementBlock::weighted_square)
            .sum();
        let parameters: f64 = self
            .parameter_prior
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.locked[*i])
            .map(|(i, w)| w * self.total_corrections[i].powi(2))
            .sum();
        let ground: f64 = (0..self.num_obs)
            .map(|k| {
                let d = self.total_ground_correction(k);
                (d.transpose() * self.ground_prior[k] * d)[(0, 0)]
            })
            .sum();
        measurements + parameters + ground
    }

    /// Redundancy of the system, never below one.
    pub fn degrees_of_freedom(&self) -> usize {
        let valid = self.blocks.iter().filter(|b| b.valid).count();
        (2 * valid).saturating_sub(self.rank).max(1)
    }

    pub fn seuw(&self) -> f64 {
        (self.weighted_residual_sum() / self.degrees_of_freedom() as f64).sqrt()
    }

    /// `sqrt(r^T W r)` of every block; zero for invalid blocks.
    pub fn standardized_residuals(&self) -> Vec<f64> {
        self.blocks
            .iter()
            .map(|b| {
                if b.valid {
                    b.weighted_square().max(0.0).sqrt()
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Solves the assembled system without applying the result.
    pub fn compute_corrections(&self, tolerance: f64) -> Result<DVector<f64>, AdjustmentError> {
        Ok(solve_symmetric(&self.normal, &self.rhs, tolerance)?)
    }

    /// Records `corrections` as this iteration's step.
    pub fn apply_corrections(&mut self, corrections: DVector<f64>) -> Result<(), AdjustmentError> {
        if corrections.len() != self.rank {
            return Err(AdjustmentError::MismatchedParameterCount {
                expected: self.rank,
                found: corrections.len(),
            });
        }
        self.total_corrections += &corrections;
        self.last_corrections = corrections;
        Ok(())
    }

    /// Solves, records the step and keeps the inverse normal matrix.
    pub fn solve_corrections(&mut self, tolerance: f64) -> Result<(), AdjustmentError> {
        let corrections = self.compute_corrections(tolerance)?;
        self.covariance = Some(invert_symmetric(&self.normal, tolerance)?);
        self.apply_corrections(corrections)
    }
}

/// One linear solve per iteration. Implementations fill
/// `state.last_corrections` (through [`NormalEquationState::apply_corrections`]).
pub trait SolutionStrategy: Debug {
    fn name(&self) -> &'static str;

    fn solve(
        &mut self,
        state: &mut NormalEquationState,
        config: &BundleConfig,
    ) -> Result<(), AdjustmentError>;
}

/// Plain weighted least squares.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedLeastSquares;

impl SolutionStrategy for WeightedLeastSquares {
    fn name(&self) -> &'static str {
        "weighted_least_squares"
    }

    fn solve(
        &mut self,
        state: &mut NormalEquationState,
        config: &BundleConfig,
    ) -> Result<(), AdjustmentError> {
        state.assemble(None);
        state.solve_corrections(config.rank_tolerance)
    }
}

/// Weighted least squares with Huber downweighting of large residuals.
#[derive(Debug, Clone, Copy)]
pub struct RobustLeastSquares {
    /// Standardized residual above which the weight falls off as `threshold / e`.
    pub threshold: f64,
}

impl RobustLeastSquares {
    pub fn huber_scales(&self, standardized: &[f64]) -> Vec<f64> {
        standardized
            .iter()
            .map(|e| {
                if *e > self.threshold {
                    self.threshold / e
                } else {
                    1.0
                }
            })
            .collect()
    }
}

impl SolutionStrategy for RobustLeastSquares {
    fn name(&self) -> &'static str {
        "robust_least_squares"
    }

    fn solve(
        &mut self,
        state: &mut NormalEquationState,
        config: &BundleConfig,
    ) -> Result<(), AdjustmentError> {
        let scales = self.huber_scales(&state.standardized_residuals());
        let downweighted = scales.iter().filter(|s| **s < 1.0).count();
        if downweighted > 0 {
            debug!("robust_least_squares: {downweighted} measurements downweighted");
        }
        state.assemble(Some(&scales));
        state.solve_corrections(config.rank_tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjustment::observation::{Measurement, Observation};
    use crate::geometry::GroundPoint;
    use crate::sensor::{rpc, RpcModel};
    use approx::assert_relative_eq;

    fn single_image_state() -> (ObservationSet<RpcModel>, NormalEquationState) {
        let model = rpc::tests::sample_rpc();
        let ground = GroundPoint::new(40.0, -105.0, 1500.0);
        let p = model.world_to_line_sample(&ground) + Vector2::new(0.5, -1.0);
        let mut set = ObservationSet::with_images(vec![model]);
        set.add_observation(
            Observation::new("gcp", ground, 0.1).with_measurement(Measurement::new(0, p, 1.0)),
        )
        .unwrap();
        let mut evaluation = Evaluation::new();
        set.evaluate(1e-4, 1.0, &mut evaluation).unwrap();
        let mut state = NormalEquationState::new(&set).unwrap();
        state.load_evaluation(&set, &evaluation).unwrap();
        (set, state)
    }

    #[test]
    fn test_state_layout() {
        let (_, state) = single_image_state();
        assert_eq!(state.num_params, 5);
        assert_eq!(state.rank, 8);
        assert_eq!(state.ground_offset(0), 5);
        assert_eq!(state.blocks.len(), 1);
        assert_eq!(state.degrees_of_freedom(), 1);
        assert_relative_eq!(state.ground_prior[0][(0, 0)], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_assembled_normal_is_symmetric() {
        let (_, mut state) = single_image_state();
        state.assemble(None);
        assert_relative_eq!(state.normal, state.normal.transpose(), epsilon = 1e-9);
        assert!(state.normal.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_locked_rows_become_identity() {
        let (mut set, _) = single_image_state();
        set.image_mut(0).unwrap().set_parameter_locked(2, true).unwrap();
        let mut evaluation = Evaluation::new();
        set.evaluate(1e-4, 1.0, &mut evaluation).unwrap();
        let mut state = NormalEquationState::new(&set).unwrap();
        state.load_evaluation(&set, &evaluation).unwrap();
        state.assemble(None);
        for j in 0..state.rank {
            let expected = if j == 2 { 1.0 } else { 0.0 };
            assert_eq!(state.normal[(2, j)], expected);
            assert_eq!(state.normal[(j, 2)], expected);
        }
        assert_eq!(state.rhs[2], 0.0);
        state.solve_corrections(1e-12).unwrap();
        assert_eq!(state.last_corrections[2], 0.0);
    }

    #[test]
    fn test_solve_reduces_residual_along_offsets() {
        let (_, mut state) = single_image_state();
        WeightedLeastSquares
            .solve(&mut state, &BundleConfig::default())
            .unwrap();
        // The 50 px parameter sigmas make the prior cost of absorbing the
        // residual negligible, so the linearized residual nearly vanishes.
        let block = &state.blocks[0];
        let dx = &state.last_corrections;
        let by_params = &block.param_partials * dx.rows(0, 5);
        let predicted = block.residual
            - Vector2::new(by_params[0], by_params[1])
            - block.ground_partials * Vector3::new(dx[5], dx[6], dx[7]);
        assert!(predicted.norm() < 1e-2);
        assert!(state.covariance.is_some());
        assert_eq!(state.total_corrections, state.last_corrections);
    }

    #[test]
    fn test_apply_corrections_checks_length() {
        let (_, mut state) = single_image_state();
        assert!(matches!(
            state.apply_corrections(DVector::zeros(3)),
            Err(AdjustmentError::MismatchedParameterCount { expected: 8, found: 3 })
        ));
    }

    #[test]
    fn test_huber_scales() {
        let strategy = RobustLeastSquares { threshold: 2.0 };
        let scales = strategy.huber_scales(&[0.5, 2.0, 4.0]);
        assert_eq!(scales, vec![1.0, 1.0, 0.5]);
    }

    #[test]
    fn test_robust_matches_weighted_for_small_residuals() {
        let (_, mut weighted) = single_image_state();
        let mut robust = weighted.clone();
        let config = BundleConfig::default();
        WeightedLeastSquares.solve(&mut weighted, &config).unwrap();
        RobustLeastSquares { threshold: 3.0 }
            .solve(&mut robust, &config)
            .unwrap();
        assert_relative_eq!(
            weighted.last_corrections,
            robust.last_corrections,
            epsilon = 1e-12
        );
    }
}
