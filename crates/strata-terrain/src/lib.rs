//! Deterministic procedural terrain generation: heightmap, biomes, hydrology,
//! roads, object placement, caves, points of interest and resources, driven
//! by an asynchronous stage orchestrator.

mod erosion;
mod grid;
mod noise_field;
mod spatial;

pub mod biome;
pub mod cave;
pub mod debug_viz;
pub mod error;
pub mod heightmap;
pub mod hydrology;
pub mod orchestrator;
pub mod placement;
pub mod poi;
pub mod request;
pub mod resources;
pub mod result;
pub mod roads;
pub mod seed;
pub mod sinks;
pub mod stage;

pub use biome::{
    BiomeClassifier, BiomeDef, BiomeId, BiomeMap, BiomeRegistry, BiomeRule, BiomeRuleTable,
    BiomeTable, ClimateConfig, ClimateGrid, ValueRange,
};
pub use cave::{CaveConfig, CaveGenerator, CaveNetwork, CaveNode, CaveSegment};
pub use erosion::{ErosionConfig, ErosionStats, erode};
pub use error::{ConfigError, Diagnostic, FailureReason, StageError};
pub use grid::{Extent, Grid, GridPos};
pub use heightmap::{HeightmapBuilder, HeightmapConfig, HeightmapGrid, RemapCurve};
pub use hydrology::{HydrologyConfig, HydrologyGraph, HydrologyRouter, Lake, LakeId};
pub use noise_field::{NoiseField, NoiseKind, OctaveConfig};
pub use orchestrator::{
    GenerationHandle, GenerationOrchestrator, GenerationOutcome, GenerationState,
    OrchestratorConfig, ProgressListener, ProgressUpdate,
};
pub use placement::{
    ObjectRule, ObjectTypeId, PlacedObject, PlacementConfig, PlacementSampler, PlacementSet,
    StructureGroup, StructureGroupRule, verify_separation,
};
pub use poi::{PoiCategory, PoiConfig, PoiId, PoiRecord, PoiSelector, PoiSet};
pub use request::{GenerationRequest, PreparedRequest};
pub use resources::{
    ResourceCategory, ResourceConfig, ResourceDistributor, ResourceInput, ResourceNode,
    ResourceRule, ResourceSet, ResourceTable, YieldDistribution,
};
pub use result::GenerationResult;
pub use roads::{RoadConfig, RoadGraph, RoadRouter};
pub use seed::StageTag;
pub use sinks::{
    MemorySaveManager, SaveManager, SinkError, SpawnBatch, SpawnSink, TerrainRegion, TerrainSink,
};
pub use spatial::{PartitionedIndex, SpatialEntry, SpatialIndex};
pub use stage::{CancelToken, Stage, StageContext};
