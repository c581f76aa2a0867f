//! dewarp - batch lens-distortion correction for drone aerial photos
//!
//! Reads the per-shot lens calibration DJI drones embed in each photo's XMP
//! metadata, removes the distortion with a Brown-Conrady remap, and writes
//! `<name>_dewarped.<ext>` copies carrying the original metadata.

mod calibration;
mod camera;
mod config;
mod error;
mod exiftool;
mod pipeline;
mod remap;
mod resample;

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Batch lens-distortion correction for drone aerial photos
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing the photos to correct
    input_dir: PathBuf,

    /// Directory to place the corrected photos in
    output_dir: PathBuf,

    /// Case-sensitive filename suffix of files to process (overrides config)
    #[arg(short, long)]
    extension: Option<String>,

    /// Worker count; 0 uses one worker per core (overrides config)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Configuration file path
    #[arg(short, long, default_value = "dewarp.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("dewarp v{}", env!("CARGO_PKG_VERSION"));

    // Both directories must exist before any file is touched.
    if !args.input_dir.is_dir() {
        bail!("\"{}\" is not a valid directory", args.input_dir.display());
    }
    if !args.output_dir.is_dir() {
        bail!("\"{}\" is not a valid directory", args.output_dir.display());
    }

    // Load or create configuration, with CLI args as overrides
    let mut config = config::Config::load_or_create(&args.config)?;
    if let Some(extension) = args.extension {
        config.batch.extension = extension;
    }
    if let Some(jobs) = args.jobs {
        config.batch.jobs = jobs;
    }

    if config.batch.jobs > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.batch.jobs)
            .build_global()?;
    }

    info!("input: {}", args.input_dir.display());
    info!("output: {}", args.output_dir.display());
    info!("filter: *{}", config.batch.extension);

    let summary = pipeline::run_batch(&args.input_dir, &args.output_dir, &config)?;

    info!(
        "done: {} corrected, {} skipped, {} failed",
        summary.corrected, summary.skipped, summary.failed
    );

    if summary.failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
