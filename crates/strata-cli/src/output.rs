//! Writers for generation output: PNG debug images, RON saves and logging sinks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use strata_terrain::debug_viz::DebugImage;
use strata_terrain::{
    GenerationOutcome, GenerationResult, ProgressListener, ProgressUpdate, SaveManager, SinkError,
    SpawnBatch, SpawnSink, TerrainRegion, TerrainSink,
};
use tracing::{debug, info};

/// Encode `image` as an 8-bit RGBA PNG at `path`.
pub fn write_png(image: &DebugImage, path: &Path) -> Result<(), SinkError> {
    let file = std::fs::File::create(path)?;
    let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), image.width, image.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder
        .write_header()
        .map_err(|e| SinkError::Serialize(e.to_string()))?;
    writer
        .write_image_data(&image.pixels)
        .map_err(|e| SinkError::Serialize(e.to_string()))?;
    Ok(())
}

/// Stores each world as `<dir>/<world_id>.ron`.
pub struct RonSaveManager {
    dir: PathBuf,
}

impl RonSaveManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, world_id: &str) -> Result<PathBuf, SinkError> {
        let valid = !world_id.is_empty()
            && world_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SinkError::Rejected(format!("invalid world id '{world_id}'")));
        }
        Ok(self.dir.join(format!("{world_id}.ron")))
    }
}

impl SaveManager for RonSaveManager {
    fn store(&self, world_id: &str, result: &GenerationResult) -> Result<(), SinkError> {
        let path = self.path(world_id)?;
        std::fs::create_dir_all(&self.dir)?;
        let text = ron::to_string(result).map_err(|e| SinkError::Serialize(e.to_string()))?;
        std::fs::write(&path, text)?;
        info!("Saved world '{world_id}' to {}", path.display());
        Ok(())
    }

    fn load(&self, world_id: &str) -> Result<Option<GenerationResult>, SinkError> {
        let path = self.path(world_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        ron::from_str(&text)
            .map(Some)
            .map_err(|e| SinkError::Serialize(e.to_string()))
    }
}

/// Counts committed regions; the CLI has no renderer to upload them to.
#[derive(Default)]
pub struct RegionCounter {
    regions: AtomicUsize,
    cells: AtomicUsize,
}

impl RegionCounter {
    pub fn regions(&self) -> usize {
        self.regions.load(Ordering::Relaxed)
    }

    pub fn cells(&self) -> usize {
        self.cells.load(Ordering::Relaxed)
    }
}

impl TerrainSink for RegionCounter {
    fn commit_region(&self, region: &TerrainRegion) -> Result<(), SinkError> {
        debug!(
            "Region at ({}, {}): {}x{}",
            region.world_origin.0, region.world_origin.1, region.extent.width, region.extent.height
        );
        self.regions.fetch_add(1, Ordering::Relaxed);
        self.cells.fetch_add(region.heights.len(), Ordering::Relaxed);
        Ok(())
    }
}

/// Logs a summary of spawnable content.
pub struct SpawnSummary;

impl SpawnSink for SpawnSummary {
    fn spawn(&self, batch: &SpawnBatch<'_>) -> Result<(), SinkError> {
        info!(
            "Spawn batch for '{}': {} objects, {} structures, {} POIs, {} resource nodes, {} cave entrances",
            batch.world_id,
            batch.placements.len(),
            batch.structure_count(),
            batch.pois.len(),
            batch.resources.len(),
            batch.cave_entrances.len()
        );
        Ok(())
    }
}

/// Logs stage boundaries.
pub struct ProgressLogger;

impl ProgressListener for ProgressLogger {
    fn on_progress(&self, update: ProgressUpdate) {
        if update.fraction <= 0.0 {
            info!(
                "[{}/{}] {:?} started",
                update.stage_index + 1,
                update.stage_count,
                update.stage
            );
        } else {
            debug!("{:?} {:.0}%", update.stage, update.fraction * 100.0);
        }
    }

    fn on_finished(&self, outcome: &GenerationOutcome) {
        info!("Generation finished: {:?}", outcome.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_written_with_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.png");
        let mut image = DebugImage::new(4, 3);
        image.set_pixel(1, 1, 255, 0, 0, 255);
        write_png(&image, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n", "File should start with the PNG signature");
    }

    #[test]
    fn test_save_manager_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let saves = RonSaveManager::new(dir.path());
        assert!(matches!(saves.path("../escape"), Err(SinkError::Rejected(_))));
        assert!(matches!(saves.path(""), Err(SinkError::Rejected(_))));
        assert!(saves.path("world_01").is_ok());
    }

    #[test]
    fn test_load_missing_world_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let saves = RonSaveManager::new(dir.path());
        assert!(saves.load("nothing-here").unwrap().is_none());
    }

    #[test]
    fn test_ron_save_roundtrip() {
        let mut request = strata_terrain::GenerationRequest::default()
            .with_seed(3)
            .with_extent(64, 64);
        request.world_id = "roundtrip".into();
        request.heightmap.falloff_width = 8;
        request.poi.poi_count = 3;
        request.poi.min_poi_separation = 10.0;
        let dir = tempfile::tempdir().unwrap();
        let saves = std::sync::Arc::new(RonSaveManager::new(dir.path()));
        let outcome = strata_terrain::GenerationOrchestrator::default()
            .with_save_manager(saves.clone())
            .run_blocking(request)
            .unwrap();
        let result = outcome.result().expect("generation should complete");

        assert!(dir.path().join("roundtrip.ron").exists());
        let loaded = saves.load("roundtrip").unwrap().expect("save should exist");
        assert_eq!(loaded.elevation_fingerprint(), result.elevation_fingerprint());
        assert_eq!(loaded.biomes, result.biomes);
        assert_eq!(loaded.placements.objects.len(), result.placements.objects.len());
        assert_eq!(loaded.caves.segments, result.caves.segments);
    }
}
