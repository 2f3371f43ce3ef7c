//! Generation requests and their synchronous validation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::biome::{BiomeRuleTable, BiomeTable, ClimateConfig};
use crate::cave::CaveConfig;
use crate::error::ConfigError;
use crate::grid::Extent;
use crate::heightmap::HeightmapConfig;
use crate::hydrology::HydrologyConfig;
use crate::noise_field::OctaveConfig;
use crate::placement::{PlacementConfig, PlacementRules};
use crate::poi::PoiConfig;
use crate::resources::{ResourceConfig, ResourceTable};
use crate::roads::RoadConfig;

/// Everything needed to generate one region.
///
/// Every field has a default, so a request file only needs to name what it
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub world_id: String,
    pub seed: u64,
    pub extent: Extent,
    /// World-space cell coordinate of cell (0, 0); adjacent requests tile.
    pub origin: (i64, i64),
    /// World units per cell.
    pub cell_size: f64,
    /// Edge of the square tiles handed to the terrain sink.
    pub region_size: u32,
    pub elevation: OctaveConfig,
    pub climate: ClimateConfig,
    pub heightmap: HeightmapConfig,
    pub biome_rules: BiomeRuleTable,
    pub hydrology: HydrologyConfig,
    pub poi: PoiConfig,
    pub roads: RoadConfig,
    pub placement: PlacementConfig,
    pub caves: CaveConfig,
    pub resources: ResourceConfig,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            world_id: String::from("world"),
            seed: 0,
            extent: Extent::default(),
            origin: (0, 0),
            cell_size: 1.0,
            region_size: 64,
            elevation: OctaveConfig::default(),
            climate: ClimateConfig::default(),
            heightmap: HeightmapConfig::default(),
            biome_rules: BiomeRuleTable::default(),
            hydrology: HydrologyConfig::default(),
            poi: PoiConfig::default(),
            roads: RoadConfig::default(),
            placement: PlacementConfig::default(),
            caves: CaveConfig::default(),
            resources: ResourceConfig::default(),
        }
    }
}

impl GenerationRequest {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = Extent::new(width, height);
        self
    }

    /// Reject invalid parameter combinations before any stage runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.prepare().map(|_| ())
    }

    /// Validate and compile every table the stages look up per cell.
    pub fn prepare(&self) -> Result<PreparedRequest, ConfigError> {
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(ConfigError::NonPositiveExtent {
                width: self.extent.width,
                height: self.extent.height,
            });
        }
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(ConfigError::invalid("cell_size", "must be finite and positive"));
        }
        if self.region_size == 0 {
            return Err(ConfigError::invalid("region_size", "must be at least 1"));
        }
        self.elevation.validate("elevation")?;
        self.climate.validate()?;
        self.heightmap.validate(self.extent)?;
        self.hydrology.validate()?;
        self.poi.validate()?;
        self.roads.validate()?;
        self.caves.validate()?;

        let biomes = self.biome_rules.compile()?;
        let placement = self.placement.compile(&biomes)?;
        let resources = self.resources.compile(&biomes)?;
        Ok(PreparedRequest {
            request: self.clone(),
            biomes: Arc::new(biomes),
            placement: Arc::new(placement),
            resources: Arc::new(resources),
        })
    }
}

/// A validated request with its lookup tables compiled.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub request: GenerationRequest,
    pub biomes: Arc<BiomeTable>,
    pub placement: Arc<PlacementRules>,
    pub resources: Arc<ResourceTable>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request_is_valid() {
        GenerationRequest::default().validate().unwrap();
    }

    #[test]
    fn test_zero_extent_rejected() {
        let err = GenerationRequest::default().with_extent(0, 64).validate().unwrap_err();
        assert_eq!(err, ConfigError::NonPositiveExtent { width: 0, height: 64 });
    }

    #[test]
    fn test_zero_octaves_rejected() {
        let mut request = GenerationRequest::default();
        request.elevation.octaves = 0;
        assert!(matches!(request.validate(), Err(ConfigError::ZeroOctaves { .. })));
    }

    #[test]
    fn test_placement_biome_must_exist() {
        let mut request = GenerationRequest::default();
        request
            .placement
            .placement_density_by_biome
            .insert("moon".into(), Vec::new());
        assert_eq!(request.validate().unwrap_err(), ConfigError::UnknownBiome("moon".into()));
    }

    #[test]
    fn test_request_parses_from_partial_json() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"seed": 9, "extent": {"width": 64, "height": 32}}"#).unwrap();
        assert_eq!(request.seed, 9);
        assert_eq!(request.extent, Extent::new(64, 32));
        assert_eq!(request.poi, PoiConfig::default());
    }
}
