//! Points of interest: scored candidate cells, top-k selection with a
//! minimum separation, and seeded category assignment.

use std::collections::BTreeMap;

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::biome::{BiomeMap, BiomeTable};
use crate::error::{ConfigError, StageError};
use crate::grid::{Extent, GridPos, try_alloc};
use crate::heightmap::HeightmapGrid;
use crate::hydrology::HydrologyGraph;
use crate::seed::{StageTag, unit_rng};
use crate::spatial::{SpatialEntry, SpatialIndex};
use crate::stage::StageContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoiId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoiCategory {
    Settlement,
    Dungeon,
    Treasure,
    QuestLocation,
    BossArena,
    Camp,
    Ruins,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoiRecord {
    pub id: PoiId,
    pub position: GridPos,
    pub category: PoiCategory,
    pub score: f64,
    /// `[0, 1]`, grows with distance from the map centre.
    pub difficulty: f64,
}

/// Selected POIs plus the number requested.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoiSet {
    pub records: Vec<PoiRecord>,
    pub requested: u32,
}

impl PoiSet {
    pub fn is_short(&self) -> bool {
        (self.records.len() as u32) < self.requested
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoiConfig {
    pub poi_count: u32,
    /// Minimum distance in cells between two POIs.
    pub min_poi_separation: f64,
    /// Slope (degrees) at which flatness reaches zero.
    pub max_poi_slope: f64,
    pub weight_flatness: f64,
    pub weight_water: f64,
    pub weight_biome: f64,
    /// Distance in cells at which water proximity halves.
    pub water_falloff: f64,
    /// The highest-scoring POIs that are always settlements.
    pub settlement_count: u32,
    /// Relative weights for the remaining categories.
    pub category_weights: BTreeMap<PoiCategory, f64>,
}

impl Default for PoiConfig {
    fn default() -> Self {
        let category_weights = BTreeMap::from([
            (PoiCategory::Dungeon, 0.2),
            (PoiCategory::Treasure, 0.15),
            (PoiCategory::QuestLocation, 0.2),
            (PoiCategory::BossArena, 0.05),
            (PoiCategory::Camp, 0.2),
            (PoiCategory::Ruins, 0.2),
        ]);
        Self {
            poi_count: 12,
            min_poi_separation: 24.0,
            max_poi_slope: 25.0,
            weight_flatness: 1.0,
            weight_water: 0.8,
            weight_biome: 1.0,
            water_falloff: 12.0,
            settlement_count: 4,
            category_weights,
        }
    }
}

impl PoiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_poi_separation.is_finite() || self.min_poi_separation < 0.0 {
            return Err(ConfigError::invalid(
                "poi.min_poi_separation",
                "must be finite and non-negative",
            ));
        }
        if !(self.max_poi_slope > 0.0) {
            return Err(ConfigError::invalid("poi.max_poi_slope", "must be positive"));
        }
        if !(self.water_falloff > 0.0) {
            return Err(ConfigError::invalid("poi.water_falloff", "must be positive"));
        }
        if self.category_weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::invalid(
                "poi.category_weights",
                "weights must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

/// Chamfer distance (1, √2) from every cell to the nearest water cell.
/// Cells are `f64::INFINITY` when the map has no water.
pub fn water_distance(
    extent: Extent,
    is_water: impl Fn(usize) -> bool,
) -> Result<Vec<f64>, StageError> {
    let n = extent.cell_count();
    let w = extent.width as usize;
    let h = extent.height as usize;
    let mut dist = try_alloc(n, f64::INFINITY, "water distance")?;
    for (i, d) in dist.iter_mut().enumerate() {
        if is_water(i) {
            *d = 0.0;
        }
    }
    let diag = std::f64::consts::SQRT_2;
    let forward = [(-1i64, -1i64, diag), (0, -1, 1.0), (1, -1, diag), (-1, 0, 1.0)];
    let backward = [(1i64, 1i64, diag), (0, 1, 1.0), (-1, 1, diag), (1, 0, 1.0)];
    let relax = |dist: &mut [f64], x: usize, y: usize, mask: &[(i64, i64, f64)]| {
        let i = y * w + x;
        let mut best = dist[i];
        for &(dx, dy, cost) in mask {
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            if nx >= 0 && ny >= 0 && (nx as usize) < w && (ny as usize) < h {
                best = best.min(dist[ny as usize * w + nx as usize] + cost);
            }
        }
        dist[i] = best;
    };
    for y in 0..h {
        for x in 0..w {
            relax(&mut dist, x, y, &forward);
        }
    }
    for y in (0..h).rev() {
        for x in (0..w).rev() {
            relax(&mut dist, x, y, &backward);
        }
    }
    Ok(dist)
}

/// Inputs the POI selector reads.
pub struct PoiInput<'a> {
    pub heightmap: &'a HeightmapGrid,
    pub biomes: &'a BiomeMap,
    pub hydrology: &'a HydrologyGraph,
}

pub struct PoiSelector<'a> {
    seed: u64,
    config: &'a PoiConfig,
    table: &'a BiomeTable,
}

impl<'a> PoiSelector<'a> {
    pub fn new(seed: u64, config: &'a PoiConfig, table: &'a BiomeTable) -> Self {
        Self {
            seed,
            config,
            table,
        }
    }

    /// Score of a single land cell.
    fn score(&self, input: &PoiInput<'_>, pos: GridPos, water_dist: f64) -> f64 {
        let c = self.config;
        let slope = input.heightmap.slope_degrees(pos);
        let flatness = 1.0 - (slope / c.max_poi_slope).min(1.0);
        let proximity = 1.0 / (1.0 + water_dist / c.water_falloff);
        let desirability = self.table.def(input.biomes.biome(pos)).poi_desirability;
        c.weight_flatness * flatness + c.weight_water * proximity + c.weight_biome * desirability
    }

    pub fn select(&self, input: &PoiInput<'_>, ctx: &StageContext) -> Result<PoiSet, StageError> {
        let requested = self.config.poi_count;
        if requested == 0 {
            return Ok(PoiSet::default());
        }
        let extent = input.heightmap.extent();
        let distances = water_distance(extent, |i| input.hydrology.is_water_index(i))?;
        ctx.report(0.2);

        let mut candidates: Vec<(f64, usize)> = (0..extent.cell_count())
            .into_par_iter()
            .filter_map(|i| {
                let pos = extent.pos(i);
                let def = self.table.def(input.biomes.biome(pos));
                if def.is_water || def.poi_desirability <= 0.0 || input.hydrology.is_water(pos) {
                    return None;
                }
                Some((self.score(input, pos, distances[i]), i))
            })
            .collect();
        ctx.check()?;
        if candidates.is_empty() {
            return Err(StageError::Failed(
                "no land cell qualifies as a point of interest".into(),
            ));
        }
        candidates.par_sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        ctx.report(0.6);

        let mut taken = SpatialIndex::new(self.config.min_poi_separation);
        let mut picked: Vec<(GridPos, f64)> = Vec::new();
        for &(score, i) in &candidates {
            let pos = extent.pos(i);
            let (x, y) = (pos.x as f64, pos.y as f64);
            if taken.any_within(x, y, self.config.min_poi_separation) {
                continue;
            }
            taken.insert(SpatialEntry::new(x, y, 0.0));
            picked.push((pos, score));
            if picked.len() as u32 >= requested {
                break;
            }
        }

        let centre = (
            (extent.width as f64 - 1.0) / 2.0,
            (extent.height as f64 - 1.0) / 2.0,
        );
        let max_dist = (centre.0 * centre.0 + centre.1 * centre.1).sqrt().max(1.0);
        let records = picked
            .into_iter()
            .enumerate()
            .map(|(n, (position, score))| {
                let id = PoiId(n as u32);
                let dx = position.x as f64 - centre.0;
                let dy = position.y as f64 - centre.1;
                PoiRecord {
                    id,
                    position,
                    category: self.category_for(id),
                    score,
                    difficulty: ((dx * dx + dy * dy).sqrt() / max_dist).min(1.0),
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            requested,
            placed = records.len(),
            candidates = candidates.len(),
            "POIs selected"
        );
        Ok(PoiSet { records, requested })
    }

    fn category_for(&self, id: PoiId) -> PoiCategory {
        if id.0 < self.config.settlement_count {
            return PoiCategory::Settlement;
        }
        let total: f64 = self.config.category_weights.values().sum();
        if total <= 0.0 {
            return PoiCategory::Settlement;
        }
        let mut rng = unit_rng(self.seed, StageTag::Poi, id.0 as u64);
        let mut roll = rng.random::<f64>() * total;
        let mut last = PoiCategory::Settlement;
        for (&category, &weight) in &self.config.category_weights {
            if weight <= 0.0 {
                continue;
            }
            last = category;
            if roll < weight {
                return category;
            }
            roll -= weight;
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biome::{BiomeDef, BiomeId, BiomeRule, BiomeRuleTable};
    use crate::hydrology::{HydrologyConfig, HydrologyRouter};

    fn land_table() -> BiomeTable {
        BiomeRuleTable {
            biomes: vec![BiomeDef::new("land", Some(1.0), 1.0, [0, 0, 0])],
            rules: vec![BiomeRule {
                biome: "land".into(),
                ..Default::default()
            }],
            fallback: "land".into(),
        }
        .compile()
        .unwrap()
    }

    fn flat_world(size: u32) -> (HeightmapGrid, BiomeMap, HydrologyGraph) {
        let extent = Extent::new(size, size);
        let heightmap =
            HeightmapGrid::from_elevations(extent, vec![0.5; extent.cell_count()], 1.0, 100.0)
                .unwrap();
        let biomes = BiomeMap::uniform(extent, BiomeId(0)).unwrap();
        let hydrology = HydrologyRouter::new(HydrologyConfig::default())
            .route(&heightmap, &StageContext::detached())
            .unwrap();
        (heightmap, biomes, hydrology)
    }

    #[test]
    fn test_selection_respects_separation_and_count() {
        let (heightmap, biomes, hydrology) = flat_world(64);
        let table = land_table();
        let config = PoiConfig {
            poi_count: 6,
            min_poi_separation: 10.0,
            ..Default::default()
        };
        let set = PoiSelector::new(1, &config, &table)
            .select(
                &PoiInput {
                    heightmap: &heightmap,
                    biomes: &biomes,
                    hydrology: &hydrology,
                },
                &StageContext::detached(),
            )
            .unwrap();
        assert_eq!(set.records.len(), 6);
        for (i, a) in set.records.iter().enumerate() {
            for b in &set.records[i + 1..] {
                assert!(a.position.distance(b.position) >= 10.0);
            }
        }
    }

    #[test]
    fn test_ties_break_by_cell_index() {
        let (heightmap, biomes, hydrology) = flat_world(16);
        let table = land_table();
        let config = PoiConfig {
            poi_count: 1,
            ..Default::default()
        };
        let set = PoiSelector::new(9, &config, &table)
            .select(
                &PoiInput {
                    heightmap: &heightmap,
                    biomes: &biomes,
                    hydrology: &hydrology,
                },
                &StageContext::detached(),
            )
            .unwrap();
        assert_eq!(set.records[0].position, GridPos::new(0, 0));
    }

    #[test]
    fn test_shortfall_when_separation_too_large() {
        let (heightmap, biomes, hydrology) = flat_world(20);
        let table = land_table();
        let config = PoiConfig {
            poi_count: 10,
            min_poi_separation: 30.0,
            ..Default::default()
        };
        let set = PoiSelector::new(1, &config, &table)
            .select(
                &PoiInput {
                    heightmap: &heightmap,
                    biomes: &biomes,
                    hydrology: &hydrology,
                },
                &StageContext::detached(),
            )
            .unwrap();
        assert!(set.is_short());
        assert_eq!(set.records.len(), 1);
    }

    #[test]
    fn test_first_pois_are_settlements() {
        let (heightmap, biomes, hydrology) = flat_world(64);
        let table = land_table();
        let config = PoiConfig {
            poi_count: 8,
            min_poi_separation: 8.0,
            settlement_count: 3,
            ..Default::default()
        };
        let set = PoiSelector::new(4, &config, &table)
            .select(
                &PoiInput {
                    heightmap: &heightmap,
                    biomes: &biomes,
                    hydrology: &hydrology,
                },
                &StageContext::detached(),
            )
            .unwrap();
        for record in &set.records[..3] {
            assert_eq!(record.category, PoiCategory::Settlement);
        }
        assert!(set.records.iter().all(|r| (0.0..=1.0).contains(&r.difficulty)));
    }

    #[test]
    fn test_chamfer_distance() {
        let extent = Extent::new(5, 1);
        let d = water_distance(extent, |i| i == 0).unwrap();
        assert_eq!(d, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let dry = water_distance(extent, |_| false).unwrap();
        assert!(dry.iter().all(|v| v.is_infinite()));
    }
}
