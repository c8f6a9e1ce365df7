//! Multi-image bundle adjustment
//!
//! Loads one sensor model per image, reads ground control and tie observations
//! from a CSV file, runs the bundle executive and writes the solution report,
//! the final residuals and the adjusted models.
//!
//! Observation CSV columns:
//! `id,image_index,sample,line,sigma_px,lat,lon,height,ground_sigma_m`.
//! Rows sharing an `id` are measurements of the same ground feature; leave the
//! ground columns empty for tie points.
//!
//! Usage:
//! ```bash
//! cargo run --example bundle_adjust -- \
//!   --models samples/rpc.yaml samples/rpc.yaml \
//!   --observations samples/observations.csv \
//!   --config samples/bundle_config.yaml
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{info, warn};
use nalgebra::Vector2;
use sensor_tools::adjustment::{
    BundleConfig, BundleExecutive, Measurement, Observation, ObservationSet, SolutionStatus,
};
use sensor_tools::geometry::{ConstantElevation, GroundPoint};
use sensor_tools::keywordlist::KeywordList;
use sensor_tools::sensor::{load_model_from_yaml, AnySensorModel, SensorModel};
use sensor_tools::util::ensure_output_dir;
use serde::Deserialize;

/// Bundle adjustment tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sensor model YAML files, one per image, in image-index order
    #[arg(short = 'm', long, num_args = 1.., required = true)]
    models: Vec<PathBuf>,

    /// Observation CSV file
    #[arg(short = 'o', long)]
    observations: PathBuf,

    /// Bundle configuration YAML (defaults apply when omitted)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Image whose parameters stay fixed
    #[arg(short = 'r', long, default_value = "0")]
    reference_image: usize,

    /// Adjustable parameters to solve in every other image
    #[arg(short = 'f', long, value_delimiter = ',', default_value = "intrack_offset,crosstrack_offset")]
    free_parameters: Vec<String>,

    /// Height used to seed tie points
    #[arg(long)]
    seed_height: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ObservationRecord {
    id: String,
    image_index: usize,
    sample: f64,
    line: f64,
    sigma_px: f64,
    lat: Option<f64>,
    lon: Option<f64>,
    height: Option<f64>,
    ground_sigma_m: Option<f64>,
}

fn load_models(cli: &Cli) -> Result<Vec<AnySensorModel>, Box<dyn std::error::Error>> {
    let mut models = Vec::with_capacity(cli.models.len());
    for (index, path) in cli.models.iter().enumerate() {
        let path = path.to_str().ok_or("model path is not valid UTF-8")?;
        info!("Loading image {index} model from: {path}");
        let mut model = load_model_from_yaml(path, "")?;
        let image_id = format!("{}_{index}", model.geometry().image_id);
        model.geometry_mut().image_id = image_id;
        let store = model.adjustable_parameters().clone();
        for p in 0..store.number_of_parameters() {
            let name = &store.parameter(p)?.description;
            let free = index != cli.reference_image && cli.free_parameters.contains(name);
            model.set_parameter_locked(p, !free)?;
        }
        models.push(model);
    }
    Ok(models)
}

fn load_observations(
    path: &str,
    images: Vec<AnySensorModel>,
) -> Result<ObservationSet<AnySensorModel>, Box<dyn std::error::Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Observation> = HashMap::new();
    for record in reader.deserialize() {
        let record: ObservationRecord = record?;
        let observation = grouped.entry(record.id.clone()).or_insert_with(|| {
            order.push(record.id.clone());
            match (record.lat, record.lon, record.height) {
                (Some(lat), Some(lon), Some(height)) => Observation::new(
                    &record.id,
                    GroundPoint::new(lat, lon, height),
                    record.ground_sigma_m.unwrap_or(1.0),
                ),
                _ => Observation::unknown(&record.id),
            }
        });
        observation.add_measurement(Measurement::new(
            record.image_index,
            Vector2::new(record.sample, record.line),
            record.sigma_px,
        ));
    }

    let mut set = ObservationSet::with_images(images);
    for id in order {
        if let Some(observation) = grouped.remove(&id) {
            set.add_observation(observation)?;
        }
    }
    Ok(set)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            BundleConfig::from_yaml_file(path.to_str().ok_or("config path is not valid UTF-8")?)?
        }
        None => BundleConfig::default(),
    };
    let models = load_models(&cli)?;
    let observations = cli
        .observations
        .to_str()
        .ok_or("observation path is not valid UTF-8")?;
    let set = load_observations(observations, models)?;
    info!(
        "{} images, {} observations, {} measurements",
        set.num_images(),
        set.num_obs(),
        set.num_meas()
    );

    let mut executive = BundleExecutive::new(config)?;
    if let Some(height) = cli.seed_height {
        executive = executive.with_elevation(Box::new(ConstantElevation::new(height)));
    }
    executive.initialize_solution(set)?;
    let status = executive.run_solution()?;
    let summary = executive.summarize_solution()?;
    println!("{summary}");
    if status != SolutionStatus::Converged {
        warn!("Bundle ended without converging: {status}");
    }

    ensure_output_dir()?;
    summary.write_json("output/bundle_summary.json")?;
    summary.write_residuals_csv("output/bundle_residuals.csv")?;
    if let Some(set) = executive.into_observations() {
        for (index, model) in set.images().iter().enumerate() {
            let mut kwl = KeywordList::new();
            model.save_state(&mut kwl, "");
            let path = format!("output/image_{index}_adjusted.yaml");
            kwl.save_to_yaml(&path)?;
            info!("Adjusted model written to {path}");
        }
    }
    info!("Report written to output/bundle_summary.json");
    Ok(())
}
