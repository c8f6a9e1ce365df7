//! Fits an RPC replacement model to any sensor model.
//!
//! The source model is sampled over an image grid at several height layers.
//! [`RpcOptimizationCost::linear_estimation`] solves the linearized RPC
//! equations `num(t) - x * (den(t) - 1) = x` by iteratively reweighted least
//! squares; [`RpcOptimizationCost::optimize`] then refines the sample and line
//! polynomials with the `tiny_solver` Levenberg-Marquardt optimizer.

use crate::geometry::{sample_image_grid, GroundPoint};
use crate::optimization::{FitError, Optimizer};
use crate::sensor::rpc::{terms, RpcCoefficients, NUM_TERMS};
use crate::sensor::{RpcModel, SensorModel};
use crate::util::{compute_reprojection_error, ProjectionError};

use log::{info, warn};
use nalgebra::{DMatrix, DVector, Vector2};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Unknowns per image axis: 20 numerator terms and 19 denominator terms
/// (the denominator constant is fixed to 1).
const NUM_UNKNOWNS: usize = 2 * NUM_TERMS - 1;

/// Reweighting passes of the linear estimation.
const LINEAR_ITERATIONS: usize = 10;

/// Cost function for `tiny_solver` optimization of one RPC image axis.
///
/// The parameter block is `[num_0..num_19, den_1..den_19]`; the residual of
/// each sample is the rational polynomial minus the normalized image coordinate.
#[derive(Debug, Clone)]
struct RpcAxisCost {
    terms: Vec<[f64; NUM_TERMS]>,
    targets: Vec<f64>,
}

impl<T: nalgebra::RealField> Factor<T> for RpcAxisCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let coeffs = &params[0];
        let mut residuals = DVector::zeros(self.targets.len());

        for (i, (t, target)) in self.terms.iter().zip(&self.targets).enumerate() {
            let mut num = T::from_f64(0.0).unwrap();
            let mut den = T::from_f64(1.0).unwrap();
            for (k, term) in t.iter().enumerate() {
                let term = T::from_f64(*term).unwrap();
                num += coeffs[k].clone() * term.clone();
                if k > 0 {
                    den += coeffs[NUM_TERMS + k - 1].clone() * term;
                }
            }
            residuals[i] = num / den - T::from_f64(*target).unwrap();
        }
        residuals
    }
}

/// Sampled correspondences between a source sensor model and its RPC replacement.
#[derive(Debug, Clone)]
pub struct RpcOptimizationCost {
    image_id: String,
    image_size: Vector2<f64>,
    image_points: Vec<Vector2<f64>>,
    ground_points: Vec<GroundPoint>,
    coefficients: RpcCoefficients,
}

fn zero_polynomials(mut normalization: RpcCoefficients) -> RpcCoefficients {
    normalization.line_num = [0.0; NUM_TERMS];
    normalization.samp_num = [0.0; NUM_TERMS];
    normalization.line_den = [0.0; NUM_TERMS];
    normalization.samp_den = [0.0; NUM_TERMS];
    normalization.line_den[0] = 1.0;
    normalization.samp_den[0] = 1.0;
    normalization
}

impl RpcOptimizationCost {
    /// Samples `source` on about `grid_points` image positions at each of
    /// `height_layers` heights spanning `reference height ± height_range` meters.
    pub fn new<M>(
        source: &M,
        grid_points: usize,
        height_layers: usize,
        height_range: f64,
    ) -> Result<Self, FitError>
    where
        M: ?Sized + SensorModel,
    {
        if height_layers < 4 {
            return Err(FitError::InvalidConfig(
                "cubic height terms need at least 4 height layers".to_string(),
            ));
        }
        if !(height_range > 0.0) {
            return Err(FitError::InvalidConfig(
                "height_range must be positive".to_string(),
            ));
        }
        let geometry = source.geometry();
        let rect = geometry.image_clip_rect;
        let mut grid = sample_image_grid(&rect, grid_points);
        grid.extend(rect.corners());

        let reference_height = geometry.reference_height();
        let mut image_points = Vec::new();
        let mut ground_points = Vec::new();
        for layer in 0..height_layers {
            let t = layer as f64 / (height_layers - 1) as f64;
            let height = reference_height - height_range + 2.0 * height_range * t;
            for p in &grid {
                let g = source.line_sample_height_to_world(p, height);
                if !g.has_nan() {
                    image_points.push(*p);
                    ground_points.push(g);
                }
            }
        }
        if ground_points.is_empty() {
            return Err(FitError::NoObservations);
        }
        if ground_points.len() < NUM_UNKNOWNS {
            return Err(FitError::InvalidConfig(format!(
                "{} samples cannot determine {} coefficients per axis",
                ground_points.len(),
                NUM_UNKNOWNS
            )));
        }

        let n = ground_points.len() as f64;
        let lat_offset = ground_points.iter().map(|g| g.lat).sum::<f64>() / n;
        let lon_offset = ground_points.iter().map(|g| g.lon).sum::<f64>() / n;
        let lat_scale = ground_points
            .iter()
            .map(|g| (g.lat - lat_offset).abs())
            .fold(1e-9_f64, f64::max);
        let lon_scale = ground_points
            .iter()
            .map(|g| (g.lon - lon_offset).abs())
            .fold(1e-9_f64, f64::max);
        let center = rect.center();

        let normalization = RpcCoefficients {
            line_offset: center.y,
            sample_offset: center.x,
            lat_offset,
            lon_offset,
            height_offset: reference_height,
            line_scale: (0.5 * rect.height()).max(1.0),
            sample_scale: (0.5 * rect.width()).max(1.0),
            lat_scale,
            lon_scale,
            height_scale: height_range,
            line_num: [0.0; NUM_TERMS],
            line_den: [0.0; NUM_TERMS],
            samp_num: [0.0; NUM_TERMS],
            samp_den: [0.0; NUM_TERMS],
        };

        info!(
            "{}: sampled {} correspondences for RPC generation",
            geometry.image_id,
            ground_points.len()
        );

        Ok(Self {
            image_id: geometry.image_id.clone(),
            image_size: geometry.image_size,
            image_points,
            ground_points,
            coefficients: zero_polynomials(normalization),
        })
    }

    pub fn coefficients(&self) -> &RpcCoefficients {
        &self.coefficients
    }

    pub fn number_of_samples(&self) -> usize {
        self.ground_points.len()
    }

    /// RPC model with the current coefficients.
    pub fn build_model(&self) -> Result<RpcModel, FitError> {
        Ok(RpcModel::new(
            &self.image_id,
            self.image_size.x,
            self.image_size.y,
            self.coefficients.clone(),
        )?)
    }

    fn normalized_terms(&self) -> Vec<[f64; NUM_TERMS]> {
        self.ground_points
            .iter()
            .map(|g| {
                let (l, p, h) = self.coefficients.normalize_ground(g);
                terms(l, p, h)
            })
            .collect()
    }

    /// Normalized `(sample, line)` targets.
    fn normalized_targets(&self) -> (Vec<f64>, Vec<f64>) {
        let c = &self.coefficients;
        self.image_points
            .iter()
            .map(|p| {
                (
                    (p.x - c.sample_offset) / c.sample_scale,
                    (p.y - c.line_offset) / c.line_scale,
                )
            })
            .unzip()
    }

    /// Iteratively reweighted linear solve for one image axis.
    fn solve_axis(
        all_terms: &[[f64; NUM_TERMS]],
        targets: &[f64],
    ) -> Result<[f64; 2 * NUM_TERMS], FitError> {
        let rows = targets.len();
        let mut num = [0.0; NUM_TERMS];
        let mut den = [0.0; NUM_TERMS];
        den[0] = 1.0;

        for pass in 0..LINEAR_ITERATIONS {
            let mut a_mat = DMatrix::zeros(rows, NUM_UNKNOWNS);
            let mut b_vec = DVector::zeros(rows);
            for (i, (t, x)) in all_terms.iter().zip(targets).enumerate() {
                let d: f64 = den.iter().zip(t).map(|(c, v)| c * v).sum();
                if d.abs() < f64::EPSILON {
                    return Err(FitError::NumericalError(
                        "RPC denominator vanished during linear estimation".to_string(),
                    ));
                }
                let w = 1.0 / d;
                for k in 0..NUM_TERMS {
                    a_mat[(i, k)] = w * t[k];
                }
                for k in 1..NUM_TERMS {
                    a_mat[(i, NUM_TERMS + k - 1)] = -w * x * t[k];
                }
                b_vec[i] = w * x;
            }

            let svd = a_mat.svd(true, true);
            let max_sv = svd.singular_values.iter().fold(0.0_f64, |m, v| m.max(*v));
            let solution = svd.solve(&b_vec, 1e-12 * max_sv).map_err(|e_str| {
                FitError::NumericalError(format!(
                    "SVD solve failed in linear estimation: {}",
                    e_str
                ))
            })?;

            let mut change = 0.0_f64;
            for k in 0..NUM_TERMS {
                change = change.max((num[k] - solution[k]).abs());
                num[k] = solution[k];
            }
            for k in 1..NUM_TERMS {
                change = change.max((den[k] - solution[NUM_TERMS + k - 1]).abs());
                den[k] = solution[NUM_TERMS + k - 1];
            }
            if pass > 0 && change < 1e-12 {
                break;
            }
        }

        let mut packed = [0.0; 2 * NUM_TERMS];
        packed[..NUM_TERMS].copy_from_slice(&num);
        packed[NUM_TERMS..].copy_from_slice(&den);
        Ok(packed)
    }

    fn pack_axis(num: &[f64; NUM_TERMS], den: &[f64; NUM_TERMS]) -> DVector<f64> {
        DVector::from_iterator(
            NUM_UNKNOWNS,
            num.iter().copied().chain(den.iter().skip(1).copied()),
        )
    }

    fn unpack_axis(params: &DVector<f64>) -> ([f64; NUM_TERMS], [f64; NUM_TERMS]) {
        let mut num = [0.0; NUM_TERMS];
        let mut den = [0.0; NUM_TERMS];
        den[0] = 1.0;
        for k in 0..NUM_TERMS {
            num[k] = params[k];
        }
        for k in 1..NUM_TERMS {
            den[k] = params[NUM_TERMS + k - 1];
        }
        (num, den)
    }
}

impl Optimizer for RpcOptimizationCost {
    /// Refines both RPC axes with `tiny_solver` Levenberg-Marquardt, starting
    /// from the current coefficients.
    fn optimize(&mut self, verbose: bool) -> Result<(), FitError> {
        let all_terms = self.normalized_terms();
        let (sample_targets, line_targets) = self.normalized_targets();
        let before = self.fit_error()?;

        let mut problem = tiny_solver::Problem::new();
        let samp_cost = RpcAxisCost {
            terms: all_terms.clone(),
            targets: sample_targets,
        };
        let line_cost = RpcAxisCost {
            terms: all_terms,
            targets: line_targets,
        };
        let num_residuals = self.ground_points.len();
        problem.add_residual_block(num_residuals, &["samp"], Box::new(samp_cost), None);
        problem.add_residual_block(num_residuals, &["line"], Box::new(line_cost), None);

        let c = &self.coefficients;
        let mut initial_values = HashMap::new();
        initial_values.insert("samp".to_string(), Self::pack_axis(&c.samp_num, &c.samp_den));
        initial_values.insert("line".to_string(), Self::pack_axis(&c.line_num, &c.line_den));

        if verbose {
            info!("Starting RPC refinement with tiny-solver Levenberg-Marquardt...");
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| FitError::NumericalError("Optimization failed".to_string()))?;

        let samp = result
            .get("samp")
            .ok_or_else(|| FitError::NumericalError("missing sample coefficients".to_string()))?;
        let line = result
            .get("line")
            .ok_or_else(|| FitError::NumericalError("missing line coefficients".to_string()))?;

        let previous = self.coefficients.clone();
        let (samp_num, samp_den) = Self::unpack_axis(samp);
        let (line_num, line_den) = Self::unpack_axis(line);
        self.coefficients.samp_num = samp_num;
        self.coefficients.samp_den = samp_den;
        self.coefficients.line_num = line_num;
        self.coefficients.line_den = line_den;
        self.coefficients.validate()?;

        let after = self.fit_error()?;
        if !(after.rmse <= before.rmse) {
            warn!(
                "{}: refinement did not improve the fit ({:.6e} -> {:.6e} px), keeping the previous coefficients",
                self.image_id, before.rmse, after.rmse
            );
            self.coefficients = previous;
        } else if verbose {
            info!(
                "RPC refinement finished, rms {:.6e} -> {:.6e} px",
                before.rmse, after.rmse
            );
        }
        Ok(())
    }

    fn linear_estimation(&mut self) -> Result<(), FitError>
    where
        Self: Sized,
    {
        let all_terms = self.normalized_terms();
        let (sample_targets, line_targets) = self.normalized_targets();
        let samp = Self::solve_axis(&all_terms, &sample_targets)?;
        let line = Self::solve_axis(&all_terms, &line_targets)?;

        self.coefficients.samp_num.copy_from_slice(&samp[..NUM_TERMS]);
        self.coefficients.samp_den.copy_from_slice(&samp[NUM_TERMS..]);
        self.coefficients.line_num.copy_from_slice(&line[..NUM_TERMS]);
        self.coefficients.line_den.copy_from_slice(&line[NUM_TERMS..]);
        self.coefficients.validate()?;
        Ok(())
    }

    fn fit_error(&self) -> Result<ProjectionError, FitError> {
        let model = self.build_model()?;
        Ok(compute_reprojection_error(
            &model,
            &self.ground_points,
            &self.image_points,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{frame, pushbroom, rpc};
    use approx::assert_relative_eq;

    #[test]
    fn test_rpc_reproduces_rpc_source() {
        let source = rpc::tests::sample_rpc();
        let mut cost = RpcOptimizationCost::new(&source, 100, 5, 400.0).unwrap();
        cost.linear_estimation().unwrap();
        let error = cost.fit_error().unwrap();
        assert!(error.max < 1e-4, "{error:?}");
    }

    #[test]
    fn test_rpc_replaces_frame_model() {
        let source = frame::tests::sample_frame();
        let mut cost = RpcOptimizationCost::new(&source, 100, 5, 200.0).unwrap();
        cost.linear_estimation().unwrap();
        let linear = cost.fit_error().unwrap();
        assert!(linear.rmse < 1e-2, "{linear:?}");

        cost.optimize(false).unwrap();
        let refined = cost.fit_error().unwrap();
        assert!(refined.rmse <= linear.rmse + 1e-12, "{refined:?}");

        // Off-grid check point.
        let model = cost.build_model().unwrap();
        let p = Vector2::new(733.0, 1291.0);
        let g = source.line_sample_height_to_world(&p, 1550.0);
        assert_relative_eq!(model.world_to_line_sample(&g), p, epsilon = 0.05);
    }

    #[test]
    fn test_rpc_replaces_pushbroom_model() {
        let source = pushbroom::tests::sample_pushbroom();
        let mut cost = RpcOptimizationCost::new(&source, 64, 4, 500.0).unwrap();
        cost.linear_estimation().unwrap();
        let error = cost.fit_error().unwrap();
        assert!(error.rmse < 0.05, "{error:?}");
    }

    #[test]
    fn test_rpc_solver_rejects_too_few_layers() {
        let source = rpc::tests::sample_rpc();
        assert!(matches!(
            RpcOptimizationCost::new(&source, 100, 3, 400.0),
            Err(FitError::InvalidConfig(_))
        ));
    }
}
