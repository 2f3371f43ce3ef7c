//! The committed output of a successful generation run.

use serde::{Deserialize, Serialize};

use crate::biome::{BiomeMap, ClimateGrid};
use crate::cave::CaveNetwork;
use crate::error::Diagnostic;
use crate::grid::{Extent, GridPos};
use crate::heightmap::HeightmapGrid;
use crate::hydrology::HydrologyGraph;
use crate::placement::PlacementSet;
use crate::poi::PoiSet;
use crate::resources::ResourceSet;
use crate::roads::RoadGraph;
use crate::seed::hash_f64_slice;
use crate::sinks::{SpawnBatch, TerrainRegion};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub world_id: String,
    pub seed: u64,
    pub heightmap: HeightmapGrid,
    pub climate: ClimateGrid,
    pub biomes: BiomeMap,
    pub hydrology: HydrologyGraph,
    pub pois: PoiSet,
    pub roads: RoadGraph,
    pub placements: PlacementSet,
    pub caves: CaveNetwork,
    pub resources: ResourceSet,
    pub diagnostics: Vec<Diagnostic>,
}

impl GenerationResult {
    pub fn extent(&self) -> Extent {
        self.heightmap.extent()
    }

    /// Hash of the elevation grid; equal for equal requests.
    pub fn elevation_fingerprint(&self) -> u64 {
        hash_f64_slice(self.heightmap.elevations())
    }

    /// Split the grids into `region_size` square tiles in row-major order.
    /// Tiles on the right and bottom edges may be smaller.
    pub fn regions(&self, region_size: u32) -> Vec<TerrainRegion> {
        let extent = self.extent();
        let size = region_size.max(1);
        let (ox, oy) = self.heightmap.origin();
        let mut regions = Vec::new();
        for y in (0..extent.height).step_by(size as usize) {
            for x in (0..extent.width).step_by(size as usize) {
                let min = GridPos::new(x, y);
                let rect = Extent::new(size.min(extent.width - x), size.min(extent.height - y));
                regions.push(TerrainRegion {
                    world_id: self.world_id.clone(),
                    min,
                    extent: rect,
                    world_origin: (ox + x as i64, oy + y as i64),
                    heights: self.heightmap.grid().copy_rect(min, rect),
                    biomes: self.biomes.grid().copy_rect(min, rect),
                });
            }
        }
        regions
    }

    /// Everything a spawn sink needs, borrowed from this result.
    pub fn spawn_batch(&self) -> SpawnBatch<'_> {
        SpawnBatch {
            world_id: &self.world_id,
            placements: &self.placements.objects,
            structures: &self.placements.structures,
            pois: &self.pois.records,
            resources: &self.resources.nodes,
            cave_entrances: self.caves.entrance_positions().collect(),
        }
    }
}
