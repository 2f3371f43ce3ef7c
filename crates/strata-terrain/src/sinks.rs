//! Downstream consumers of a finished generation.
//!
//! The core never uploads, spawns or persists anything itself. It hands
//! borrowed views to these traits after the pipeline has completed.

use dashmap::DashMap;

use crate::biome::BiomeId;
use crate::grid::{Extent, GridPos};
use crate::placement::{PlacedObject, StructureGroup};
use crate::poi::PoiRecord;
use crate::resources::ResourceNode;
use crate::result::GenerationResult;

/// Errors reported by sinks and save managers.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

/// One square tile of committed terrain.
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainRegion {
    pub world_id: String,
    /// First cell of the tile inside the request grid.
    pub min: GridPos,
    pub extent: Extent,
    /// World-space cell coordinate of `min`.
    pub world_origin: (i64, i64),
    /// Row-major normalized elevations.
    pub heights: Vec<f64>,
    pub biomes: Vec<BiomeId>,
}

/// Content for the engine to instantiate.
#[derive(Clone, Debug, PartialEq)]
pub struct SpawnBatch<'a> {
    pub world_id: &'a str,
    pub placements: &'a [PlacedObject],
    pub structures: &'a [StructureGroup],
    pub pois: &'a [PoiRecord],
    pub resources: &'a [ResourceNode],
    pub cave_entrances: Vec<GridPos>,
}

impl SpawnBatch<'_> {
    pub fn len(&self) -> usize {
        self.placements.len()
            + self.structure_count()
            + self.pois.len()
            + self.resources.len()
            + self.cave_entrances.len()
    }

    pub fn structure_count(&self) -> usize {
        self.structures.iter().map(|g| g.members.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives terrain tiles, e.g. for GPU upload.
pub trait TerrainSink: Send + Sync {
    fn commit_region(&self, region: &TerrainRegion) -> Result<(), SinkError>;
}

/// Receives spawnable content.
pub trait SpawnSink: Send + Sync {
    fn spawn(&self, batch: &SpawnBatch<'_>) -> Result<(), SinkError>;
}

/// Persists and restores results by world id.
pub trait SaveManager: Send + Sync {
    fn store(&self, world_id: &str, result: &GenerationResult) -> Result<(), SinkError>;
    fn load(&self, world_id: &str) -> Result<Option<GenerationResult>, SinkError>;
}

/// Keeps results in memory; mainly useful for tests and tools.
#[derive(Default)]
pub struct MemorySaveManager {
    worlds: DashMap<String, GenerationResult>,
}

impl MemorySaveManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.worlds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worlds.is_empty()
    }
}

impl SaveManager for MemorySaveManager {
    fn store(&self, world_id: &str, result: &GenerationResult) -> Result<(), SinkError> {
        self.worlds.insert(world_id.to_string(), result.clone());
        Ok(())
    }

    fn load(&self, world_id: &str) -> Result<Option<GenerationResult>, SinkError> {
        Ok(self.worlds.get(world_id).map(|r| r.value().clone()))
    }
}
