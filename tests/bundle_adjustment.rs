use approx::assert_relative_eq;
use nalgebra::Vector2;
use sensor_tools::adjustment::{
    AdjustmentError, BundleConfig, BundleExecutive, Evaluation, Measurement, NormalEquationState,
    Observation, ObservationSet, SolutionStatus, SolutionStrategy, StrategyKind,
};
use sensor_tools::geometry::{ConstantElevation, GroundPoint};
use sensor_tools::sensor::frame::FrameParameters;
use sensor_tools::sensor::{load_model_from_yaml, AnySensorModel, FrameModel, SensorModel};

const INTRACK_OFFSET: usize = 0;
const CROSSTRACK_OFFSET: usize = 1;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn load_rpc(image_id: &str) -> AnySensorModel {
    let mut model = load_model_from_yaml("samples/rpc.yaml", "").unwrap();
    model.geometry_mut().image_id = image_id.to_string();
    model
}

fn sample_frame() -> FrameModel {
    let parameters = FrameParameters {
        platform: GroundPoint::new(35.0, -110.0, 3000.0),
        roll: 0.5,
        pitch: -0.3,
        heading: 30.0,
        focal_length: 100.0,
        pixel_size: 0.01,
        principal_point: Vector2::new(999.5, 999.5),
    };
    FrameModel::new("frame", 2000.0, 2000.0, parameters, 1500.0).unwrap()
}

fn ground_grid() -> Vec<GroundPoint> {
    let mut points = Vec::new();
    for lat in [39.98, 40.0, 40.02] {
        for lon in [-105.02, -105.0, -104.98] {
            points.push(GroundPoint::new(lat, lon, 1450.0 + 100.0 * (lat - 39.98) / 0.04));
        }
    }
    points
}

/// Two RPC images measured from the true geometry. Image B starts with a
/// 1-pixel intrack error and only that parameter is free; ground points are
/// tightly constrained.
fn intrack_offset_scenario() -> ObservationSet<AnySensorModel> {
    let truth = load_rpc("truth");
    let mut a = load_rpc("A");
    let mut b = load_rpc("B");
    b.set_adjustable_parameter(INTRACK_OFFSET, 1.0 / 50.0).unwrap();
    for p in 0..b.number_of_adjustable_parameters() {
        a.set_parameter_locked(p, true).unwrap();
        b.set_parameter_locked(p, p != INTRACK_OFFSET).unwrap();
    }
    let mut set = ObservationSet::with_images(vec![a, b]);
    for (n, ground) in ground_grid().into_iter().enumerate() {
        let p = truth.world_to_line_sample(&ground);
        set.add_observation(
            Observation::new(&format!("gcp{n}"), ground, 0.01)
                .with_measurement(Measurement::new(0, p, 0.5))
                .with_measurement(Measurement::new(1, p, 0.5)),
        )
        .unwrap();
    }
    set
}

/// Steps against the least-squares solution.
#[derive(Debug)]
struct NegatedCorrections;

impl SolutionStrategy for NegatedCorrections {
    fn name(&self) -> &'static str {
        "negated_corrections"
    }

    fn solve(
        &mut self,
        state: &mut NormalEquationState,
        config: &BundleConfig,
    ) -> Result<(), AdjustmentError> {
        state.assemble(None);
        let corrections = state.compute_corrections(config.rank_tolerance)?;
        state.apply_corrections(-corrections)
    }
}

#[test]
fn test_models_round_trip() {
    let rpc = load_rpc("rpc");
    let frame = sample_frame();
    let models: [&dyn SensorModel; 2] = [&rpc, &frame];
    for model in models {
        let rect = *model.image_clip_rect();
        for p in rect.corners().into_iter().chain([rect.center()]) {
            let ground = model.line_sample_height_to_world(&p, 1500.0);
            assert!(!ground.has_nan());
            assert_relative_eq!(model.world_to_line_sample(&ground), p, epsilon = 1e-3);
        }
    }
}

#[test]
fn test_terrain_round_trip() {
    let rpc = load_rpc("rpc");
    let terrain = ConstantElevation::new(1720.0);
    let p = Vector2::new(321.0, 654.0);
    let ground = rpc.line_sample_to_world(&p, &terrain);
    assert_relative_eq!(ground.height, 1720.0, epsilon = 1e-6);
    assert_relative_eq!(rpc.world_to_line_sample(&ground), p, epsilon = 1e-3);
}

#[test]
fn test_zero_parameters_are_neutral() {
    let base = load_rpc("rpc");
    let mut adjusted = base.clone();
    let ground = GroundPoint::new(40.01, -104.99, 1600.0);
    let reference = base.world_to_line_sample(&ground);

    adjusted.set_adjustable_parameters(&[0.0; 5]).unwrap();
    assert_relative_eq!(adjusted.world_to_line_sample(&ground), reference, epsilon = 1e-12);

    adjusted.set_adjustable_parameter(CROSSTRACK_OFFSET, 0.4).unwrap();
    assert_relative_eq!(
        adjusted.world_to_line_sample(&ground),
        reference + Vector2::new(20.0, 0.0),
        epsilon = 1e-9
    );
    adjusted.reset_adjustable_parameters();
    assert_relative_eq!(adjusted.world_to_line_sample(&ground), reference, epsilon = 1e-12);
}

#[test]
fn test_evaluate_does_not_change_state() {
    let set = intrack_offset_scenario();
    let before = set.clone();
    let mut first = Evaluation::new();
    let mut second = Evaluation::new();
    set.evaluate(1e-4, 1.0, &mut first).unwrap();
    set.evaluate(1e-4, 1.0, &mut second).unwrap();
    assert_eq!(first, second);
    assert_eq!(set, before);
}

#[test]
fn test_intrack_offset_is_recovered() {
    init_logger();
    let mut executive = BundleExecutive::new(BundleConfig::default()).unwrap();
    executive.initialize_solution(intrack_offset_scenario()).unwrap();
    let status = executive.run_solution().unwrap();
    assert_eq!(status, SolutionStatus::Converged);
    assert!(executive.iterations() <= 3);

    let history = executive.seuw_history();
    assert!(history.len() >= 2);
    for pair in history.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-9, "SEUW increased: {history:?}");
    }

    let set = executive.observations().unwrap();
    let b = set.image(1).unwrap();
    let offset_px = b.compute_parameter_offset(INTRACK_OFFSET);
    assert!(offset_px.abs() < 0.01, "intrack offset {offset_px}");
    for p in 1..5 {
        assert_eq!(b.adjustable_parameters().value(p).unwrap(), 0.0);
    }
    for (k, ground) in ground_grid().iter().enumerate() {
        assert!(set.observations()[k].ground_point.distance_to(ground) < 0.05);
    }

    let summary = executive.summarize_solution().unwrap();
    assert_eq!(summary.num_measurements, 18);
    assert_eq!(summary.iteration_log.len(), executive.iterations());
    assert!(summary.residual_statistics.unwrap().rmse < 0.01);
}

#[test]
fn test_robust_strategy_converges() {
    let config = BundleConfig {
        solution_strategy: StrategyKind::RobustLeastSquares,
        ..BundleConfig::default()
    };
    let mut executive = BundleExecutive::new(config).unwrap();
    assert_eq!(executive.strategy_name(), "robust_least_squares");
    executive.initialize_solution(intrack_offset_scenario()).unwrap();
    assert_eq!(executive.run_solution().unwrap(), SolutionStatus::Converged);
}

#[test]
fn test_divergence_is_detected_at_third_iteration() {
    init_logger();
    let mut executive = BundleExecutive::new(BundleConfig::default())
        .unwrap()
        .with_strategy(Box::new(NegatedCorrections));
    executive.initialize_solution(intrack_offset_scenario()).unwrap();
    let status = executive.run_solution().unwrap();
    assert_eq!(status, SolutionStatus::Diverged);
    assert_eq!(executive.iterations(), 3);
    let history = executive.seuw_history();
    assert_eq!(history.len(), 4);
    assert!(history[1] > history[0] && history[2] > history[1] && history[3] > history[2]);
}

#[test]
fn test_max_iterations_exceeded() {
    let config = BundleConfig {
        max_iterations: 1,
        ..BundleConfig::default()
    };
    let mut executive = BundleExecutive::new(config).unwrap();
    executive.initialize_solution(intrack_offset_scenario()).unwrap();
    assert_eq!(
        executive.run_solution().unwrap(),
        SolutionStatus::MaxIterExceeded
    );
}

#[test]
fn test_empty_set_leaves_models_untouched() {
    let mut a = load_rpc("A");
    a.set_adjustable_parameter(INTRACK_OFFSET, 0.3).unwrap();
    let set = ObservationSet::with_images(vec![a.clone(), load_rpc("B")]);
    let mut executive = BundleExecutive::new(BundleConfig::default()).unwrap();
    assert!(matches!(
        executive.initialize_solution(set),
        Err(AdjustmentError::EmptyObservationSet)
    ));
    assert!(matches!(
        executive.run_solution(),
        Err(AdjustmentError::NotInitialized)
    ));
    let returned = executive.into_observations().unwrap();
    assert_eq!(returned.images()[0], a);
    assert_eq!(returned.num_obs(), 0);
}

#[test]
fn test_locked_parameter_is_not_adjusted() {
    let set = intrack_offset_scenario();
    // Lock the only free parameter: nothing left to absorb the offset.
    let mut images = set.images().to_vec();
    images[1].set_parameter_locked(INTRACK_OFFSET, true).unwrap();
    let mut locked = ObservationSet::with_images(images);
    for observation in set.observations() {
        locked.add_observation(observation.clone()).unwrap();
    }
    let mut executive = BundleExecutive::new(BundleConfig::default()).unwrap();
    executive.initialize_solution(locked).unwrap();
    executive.run_solution().unwrap();
    let b = executive.observations().unwrap().image(1).unwrap();
    assert_eq!(b.adjustable_parameters().value(INTRACK_OFFSET).unwrap(), 1.0 / 50.0);
}

#[test]
fn test_unknown_tie_point_is_seeded_and_solved() {
    let mut set = intrack_offset_scenario();
    let truth = load_rpc("truth");
    let tie = GroundPoint::new(40.005, -104.995, 1500.0);
    let p = truth.world_to_line_sample(&tie);
    set.add_observation(
        Observation::unknown("tie")
            .with_measurement(Measurement::new(0, p, 0.5))
            .with_measurement(Measurement::new(1, p, 0.5)),
    )
    .unwrap();
    let mut executive = BundleExecutive::new(BundleConfig::default())
        .unwrap()
        .with_elevation(Box::new(ConstantElevation::new(1500.0)));
    executive.initialize_solution(set).unwrap();
    let status = executive.run_solution().unwrap();
    assert_eq!(status, SolutionStatus::Converged);
    let solved = executive
        .observations()
        .unwrap()
        .find_observation("tie")
        .unwrap()
        .ground_point;
    assert!(!solved.has_nan());
    // Horizontal position is pinned by image A; height is weakly determined.
    let d = tie.neu_to(&solved);
    assert!(d.x.abs() < 1.0 && d.y.abs() < 1.0);
}

#[test]
fn test_summary_reports_written() {
    let mut executive = BundleExecutive::new(BundleConfig::default()).unwrap();
    executive.initialize_solution(intrack_offset_scenario()).unwrap();
    executive.run_solution().unwrap();
    let summary = executive.summarize_solution().unwrap();

    let dir = std::env::temp_dir();
    let json = dir.join("sensor_tools_bundle_summary.json");
    let csv = dir.join("sensor_tools_bundle_residuals.csv");
    summary.write_json(json.to_str().unwrap()).unwrap();
    summary.write_residuals_csv(csv.to_str().unwrap()).unwrap();

    let contents = std::fs::read_to_string(&json).unwrap();
    assert!(contents.contains("\"intrack_offset\""));
    let rows = std::fs::read_to_string(&csv).unwrap();
    assert_eq!(rows.lines().count(), 1 + summary.residuals.len());
    assert!(rows.starts_with("observation_id,image_index,image_id"));
}
