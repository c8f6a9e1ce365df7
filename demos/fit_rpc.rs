//! RPC replacement model generation
//!
//! Samples any supported sensor model over an image grid and several height
//! layers, fits a rational polynomial model to it (linear estimation followed
//! by Levenberg-Marquardt refinement) and writes the result as a keyword YAML.
//!
//! Usage:
//! ```bash
//! cargo run --example fit_rpc -- --input-path samples/rpc.yaml --grid-points 400
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::info;
use sensor_tools::keywordlist::KeywordList;
use sensor_tools::optimization::{Optimizer, RpcOptimizationCost};
use sensor_tools::sensor::{load_model_from_yaml, SensorModel};
use sensor_tools::util::ensure_output_dir;

/// RPC replacement model fitter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the input sensor model YAML file
    #[arg(short = 'p', long)]
    input_path: PathBuf,

    /// Approximate number of image grid points per height layer
    #[arg(short = 'n', long, default_value = "400")]
    grid_points: usize,

    /// Number of height layers
    #[arg(short = 'l', long, default_value = "5")]
    height_layers: usize,

    /// Half-width of the sampled height range around the reference height, meters
    #[arg(short = 'r', long, default_value = "500")]
    height_range: f64,

    /// Skip the nonlinear refinement
    #[arg(long)]
    linear_only: bool,
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
    let input = cli.input_path.to_str().ok_or("input path is not valid UTF-8")?;
    let source = load_model_from_yaml(input, "")?;
    info!(
        "Loaded {} model {} ({} x {})",
        source.model_type(),
        source.geometry().image_id,
        source.geometry().image_size.x,
        source.geometry().image_size.y
    );

    let start = Instant::now();
    let mut cost =
        RpcOptimizationCost::new(&source, cli.grid_points, cli.height_layers, cli.height_range)?;
    info!("Sampled {} correspondences", cost.number_of_samples());

    cost.linear_estimation()?;
    info!("Linear estimation: {:?}", cost.fit_error()?);
    if !cli.linear_only {
        cost.optimize(true)?;
        info!("Refined: {:?}", cost.fit_error()?);
    }
    info!("Fit took {:.2?}", start.elapsed());

    let rpc = cost.build_model()?;
    let mut kwl = KeywordList::new();
    rpc.save_state(&mut kwl, "");
    ensure_output_dir()?;
    let output = format!("output/{}_rpc.yaml", source.geometry().image_id);
    kwl.save_to_yaml(&output)?;
    info!("RPC written to {output}");
    Ok(())
}
