//! Command-line world generator.
//!
//! Loads `worldgen.ron`, applies CLI overrides, generates one region through
//! the orchestrator, writes debug images and (optionally) a RON save, then
//! runs the environment cycle for the requested number of game hours.
//!
//! Run with: `cargo run -p strata-cli -- --seed 42 --width 512 --height 512`

mod output;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use strata_config::{CliArgs, Config, default_config_dir};
use strata_environment::{EnvironmentCycleController, EnvironmentEvent};
use strata_terrain::debug_viz::{self, BaseLayer, DebugLayers};
use strata_terrain::{GenerationOrchestrator, GenerationOutcome, GenerationResult, GridPos};
use tracing::{error, info, warn};

use crate::output::{ProgressLogger, RegionCounter, RonSaveManager, SpawnSummary, write_png};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli_overrides(&args);

    let log_dir = config.output.output_dir.join("logs");
    strata_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    info!(
        "Generating '{}' seed={} {}x{}",
        config.request.world_id,
        config.request.seed,
        config.request.extent.width,
        config.request.extent.height
    );

    let regions = Arc::new(RegionCounter::default());
    let mut orchestrator = GenerationOrchestrator::new(config.runtime.clone())
        .with_terrain_sink(regions.clone())
        .with_spawn_sink(Arc::new(SpawnSummary))
        .with_listener(Arc::new(ProgressLogger));
    if config.output.save_results {
        orchestrator = orchestrator.with_save_manager(Arc::new(RonSaveManager::new(
            config.output.output_dir.join("saves"),
        )));
    }

    let outcome = match orchestrator.run_blocking(config.request.clone()) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Invalid generation request: {e}");
            return ExitCode::FAILURE;
        }
    };
    let result = match outcome {
        GenerationOutcome::Completed(result) => result,
        GenerationOutcome::Cancelled => {
            warn!("Generation cancelled");
            return ExitCode::FAILURE;
        }
        GenerationOutcome::Failed(reason) => {
            error!("Generation failed: {reason}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Committed {} regions ({} cells)",
        regions.regions(),
        regions.cells()
    );
    summarize(&result);

    if config.output.debug_images
        && let Err(e) = write_debug_images(&config, &result)
    {
        error!("Failed to write debug images: {e}");
        return ExitCode::FAILURE;
    }

    if let Some(hours) = args.simulate_hours {
        simulate_environment(&config, &result, hours);
    }
    ExitCode::SUCCESS
}

fn summarize(result: &GenerationResult) {
    let (lo, hi) = result.heightmap.range();
    info!("Elevation range [{lo:.3}, {hi:.3}]");
    info!(
        "{} lakes, {} river edges, {} POIs, {} road edges, {} objects, {} cave nodes, {} resource nodes",
        result.hydrology.lakes.len(),
        result.hydrology.edges.len(),
        result.pois.records.len(),
        result.roads.edges.len(),
        result.placements.objects.len(),
        result.caves.nodes.len(),
        result.resources.nodes.len()
    );
    for diagnostic in &result.diagnostics {
        warn!("{diagnostic}");
    }
}

fn write_debug_images(
    config: &Config,
    result: &GenerationResult,
) -> Result<(), strata_terrain::SinkError> {
    let table = config
        .request
        .biome_rules
        .compile()
        .map_err(|e| strata_terrain::SinkError::Rejected(e.to_string()))?;
    let dir = &config.output.output_dir;
    std::fs::create_dir_all(dir)?;

    let elevation = debug_viz::render(result, &table, &DebugLayers::base_only(BaseLayer::Elevation));
    let biomes = debug_viz::render(result, &table, &DebugLayers::default());
    let content = debug_viz::render(
        result,
        &table,
        &DebugLayers {
            placements: true,
            resources: true,
            ..Default::default()
        },
    );
    for (name, image) in [
        ("elevation", &elevation),
        ("biomes", &biomes),
        ("content", &content),
    ] {
        let path = dir.join(format!("{}_{name}.png", result.world_id));
        write_png(image, &path)?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

/// Run the environment cycle in one-minute steps, standing at the world centre.
fn simulate_environment(config: &Config, result: &GenerationResult, hours: f64) {
    let mut controller = match EnvironmentCycleController::new(result.seed, config.environment.clone())
    {
        Ok(controller) => controller,
        Err(e) => {
            error!("Invalid environment config: {e}");
            return;
        }
    };
    let extent = result.extent();
    let centre = extent.index(GridPos::new(extent.width / 2, extent.height / 2));
    let biome = result.biomes.biome_at_index(centre);
    if let Ok(table) = config.request.biome_rules.compile() {
        controller.set_biome(Some(&table.def(biome).name));
    }

    let step_seconds = config.environment.minutes_per_game_hour;
    let steps = (hours * 60.0).max(0.0) as u64;
    for _ in 0..steps {
        for event in controller.advance(step_seconds) {
            match event {
                EnvironmentEvent::DayStarted { day } => info!("Day {day} begins"),
                other => info!("{other:?}"),
            }
        }
    }
    let state = controller.state();
    info!(
        "After {hours}h: day {} {:?}, {:?}, {:?}, sun {:.1}°, daylight {:.2}",
        state.day_index,
        state.season,
        state.phase,
        state.weather,
        controller.sun_angle(),
        controller.daylight_factor()
    );
}
