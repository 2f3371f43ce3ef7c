//! Command-line argument parsing for the world generator.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Strata world generator command-line arguments.
///
/// CLI values override settings loaded from `worldgen.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "strata", about = "Deterministic procedural terrain generator")]
pub struct CliArgs {
    /// World seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Region width in cells.
    #[arg(long)]
    pub width: Option<u32>,

    /// Region height in cells.
    #[arg(long)]
    pub height: Option<u32>,

    /// Per-cell worker threads (0 = all cores).
    #[arg(long)]
    pub threads: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output directory for images and saves.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Run the environment cycle for this many game hours after generating.
    #[arg(long)]
    pub simulate_hours: Option<f64>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(seed) = args.seed {
            self.request.seed = seed;
        }
        if let Some(w) = args.width {
            self.request.extent.width = w;
        }
        if let Some(h) = args.height {
            self.request.extent.height = h;
        }
        if let Some(threads) = args.threads {
            self.runtime.worker_threads = threads;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(ref dir) = args.output {
            self.output.output_dir = dir.clone();
        }
    }
}
