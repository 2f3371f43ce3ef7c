//! Stratified resource distribution.
//!
//! The region is divided into square strata. For every stratum and every rule
//! of the distribution table a vein may spawn at a jittered point inside the
//! stratum; veins scatter nodes around their centre with yields drawn from the
//! rule's distribution. A node is kept only when its own cell passes the same
//! biome, elevation and water checks as the vein centre. Each stratum owns
//! its substream, so strata are sampled in parallel and merged in index order.

use std::collections::BTreeMap;
use std::f64::consts::TAU;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, Uniform};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::biome::{BiomeMap, BiomeTable, ValueRange};
use crate::error::{ConfigError, StageError};
use crate::grid::GridPos;
use crate::heightmap::HeightmapGrid;
use crate::hydrology::HydrologyGraph;
use crate::seed::{StageTag, det_cos, det_sin, det_sqrt, unit_rng};
use crate::stage::StageContext;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceCategory {
    #[default]
    Ore,
    Gem,
    Stone,
    Herb,
    Crystal,
}

/// How a node's base yield is drawn.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum YieldDistribution {
    Constant { value: f64 },
    Uniform { min: f64, max: f64 },
    /// Negative draws are clamped to zero.
    Normal { mean: f64, std_dev: f64 },
}

impl Default for YieldDistribution {
    fn default() -> Self {
        Self::Uniform { min: 5.0, max: 15.0 }
    }
}

impl YieldDistribution {
    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        let ok = match *self {
            Self::Constant { value } => value.is_finite() && value >= 0.0,
            Self::Uniform { min, max } => min.is_finite() && max.is_finite() && min <= max,
            Self::Normal { mean, std_dev } => mean.is_finite() && std_dev.is_finite() && std_dev >= 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigError::invalid(field, "invalid yield distribution parameters"))
        }
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        let value = match *self {
            Self::Constant { value } => value,
            Self::Uniform { min, max } => match Uniform::new_inclusive(min, max) {
                Ok(dist) => dist.sample(rng),
                Err(_) => min,
            },
            Self::Normal { mean, std_dev } => match Normal::new(mean, std_dev) {
                Ok(dist) => dist.sample(rng),
                Err(_) => mean,
            },
        };
        value.max(0.0)
    }
}

/// One row of the resource distribution table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRule {
    pub name: String,
    pub category: ResourceCategory,
    /// Chance per stratum before the biome multiplier.
    pub probability: f64,
    /// Multiplier per biome name. Empty means every land biome at 1.0;
    /// otherwise unlisted biomes are excluded.
    pub biome_multipliers: BTreeMap<String, f64>,
    pub elevation_range: ValueRange,
    pub nodes_per_vein: u32,
    /// Node scatter radius in cells.
    pub vein_radius: f64,
    /// Vein richness is drawn uniformly from this range.
    pub richness_range: (f64, f64),
    pub yield_distribution: YieldDistribution,
}

impl Default for ResourceRule {
    fn default() -> Self {
        Self {
            name: String::from("resource"),
            category: ResourceCategory::Ore,
            probability: 0.2,
            biome_multipliers: BTreeMap::new(),
            elevation_range: ValueRange::FULL,
            nodes_per_vein: 4,
            vein_radius: 4.0,
            richness_range: (0.5, 1.5),
            yield_distribution: YieldDistribution::default(),
        }
    }
}

fn multipliers(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(b, m)| (b.to_string(), *m)).collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Stratum edge in cells.
    pub stratum_size: u32,
    pub resource_distribution_table: Vec<ResourceRule>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            stratum_size: 32,
            resource_distribution_table: vec![
                ResourceRule {
                    name: "coal".into(),
                    probability: 0.35,
                    elevation_range: ValueRange::above(0.3),
                    yield_distribution: YieldDistribution::Normal { mean: 20.0, std_dev: 5.0 },
                    ..Default::default()
                },
                ResourceRule {
                    name: "iron".into(),
                    probability: 0.25,
                    biome_multipliers: multipliers(&[
                        ("mountain", 2.0),
                        ("snow", 1.0),
                        ("tundra", 1.0),
                        ("taiga", 1.0),
                        ("grassland", 0.5),
                        ("forest", 0.5),
                    ]),
                    elevation_range: ValueRange::above(0.45),
                    ..Default::default()
                },
                ResourceRule {
                    name: "copper".into(),
                    probability: 0.2,
                    elevation_range: ValueRange::new(0.3, 0.8),
                    ..Default::default()
                },
                ResourceRule {
                    name: "gold".into(),
                    probability: 0.05,
                    biome_multipliers: multipliers(&[("mountain", 2.0), ("desert", 1.0), ("snow", 1.5)]),
                    elevation_range: ValueRange::above(0.6),
                    nodes_per_vein: 2,
                    vein_radius: 2.0,
                    yield_distribution: YieldDistribution::Uniform { min: 1.0, max: 4.0 },
                    ..Default::default()
                },
                ResourceRule {
                    name: "gems".into(),
                    category: ResourceCategory::Gem,
                    probability: 0.03,
                    biome_multipliers: multipliers(&[("mountain", 1.0), ("snow", 1.0)]),
                    nodes_per_vein: 1,
                    vein_radius: 0.0,
                    yield_distribution: YieldDistribution::Constant { value: 1.0 },
                    ..Default::default()
                },
                ResourceRule {
                    name: "herbs".into(),
                    category: ResourceCategory::Herb,
                    probability: 0.3,
                    biome_multipliers: multipliers(&[
                        ("forest", 1.5),
                        ("rainforest", 2.0),
                        ("grassland", 1.0),
                        ("swamp", 1.0),
                    ]),
                    nodes_per_vein: 6,
                    vein_radius: 6.0,
                    yield_distribution: YieldDistribution::Uniform { min: 1.0, max: 3.0 },
                    ..Default::default()
                },
            ],
        }
    }
}

impl ResourceConfig {
    /// Validate rules and resolve biome names against `table`.
    pub fn compile(&self, table: &BiomeTable) -> Result<ResourceTable, ConfigError> {
        if self.stratum_size == 0 {
            return Err(ConfigError::invalid("resources.stratum_size", "must be at least 1"));
        }
        let biome_count = table.registry().len();
        let mut rules = Vec::with_capacity(self.resource_distribution_table.len());
        for rule in &self.resource_distribution_table {
            let field = format!("resources.{}", rule.name);
            if !(0.0..=1.0).contains(&rule.probability) {
                return Err(ConfigError::invalid(field, "probability must be in [0, 1]"));
            }
            if !rule.vein_radius.is_finite() || rule.vein_radius < 0.0 {
                return Err(ConfigError::invalid(field, "vein radius must be non-negative"));
            }
            let (lo, hi) = rule.richness_range;
            if !(lo >= 0.0 && lo <= hi && hi.is_finite()) {
                return Err(ConfigError::invalid(field, "richness range must be non-negative and ordered"));
            }
            rule.yield_distribution.validate(&field)?;

            let mut by_biome = vec![0.0; biome_count];
            if rule.biome_multipliers.is_empty() {
                for (id, def) in table.registry().iter() {
                    if !def.is_water {
                        by_biome[id.0 as usize] = 1.0;
                    }
                }
            } else {
                for (name, &m) in &rule.biome_multipliers {
                    if !m.is_finite() || m < 0.0 {
                        return Err(ConfigError::invalid(field, "biome multiplier must be non-negative"));
                    }
                    let id = table.registry().require(name)?;
                    if m > 0.0 && table.def(id).is_water {
                        return Err(ConfigError::invalid(
                            field,
                            format!("resources cannot spawn in water biome '{name}'"),
                        ));
                    }
                    by_biome[id.0 as usize] = m;
                }
            }
            rules.push(CompiledResource {
                rule: rule.clone(),
                by_biome,
            });
        }
        Ok(ResourceTable {
            stratum_size: self.stratum_size,
            rules,
        })
    }
}

#[derive(Clone, Debug)]
struct CompiledResource {
    rule: ResourceRule,
    /// Zero for excluded and water biomes.
    by_biome: Vec<f64>,
}

impl CompiledResource {
    fn multiplier(&self, biomes: &BiomeMap, pos: GridPos) -> f64 {
        self.by_biome[biomes.biome(pos).0 as usize]
    }

    fn eligible(&self, world: &ResourceInput<'_>, pos: GridPos) -> bool {
        self.multiplier(world.biomes, pos) > 0.0
            && self.rule.elevation_range.contains(world.heightmap.elevation(pos))
            && !world.hydrology.is_water(pos)
    }
}

/// Resource rules resolved against a biome table.
#[derive(Clone, Debug)]
pub struct ResourceTable {
    stratum_size: u32,
    rules: Vec<CompiledResource>,
}

impl ResourceTable {
    pub fn names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.rule.name.clone()).collect()
    }

    /// True when a node of resource `index` may sit on `pos`: the biome has a
    /// positive multiplier, the elevation is in range and the cell is dry.
    pub fn is_eligible(&self, index: usize, world: &ResourceInput<'_>, pos: GridPos) -> bool {
        self.rules
            .get(index)
            .is_some_and(|compiled| compiled.eligible(world, pos))
    }
}

/// Committed grids the resource stage reads.
#[derive(Clone, Copy)]
pub struct ResourceInput<'a> {
    pub heightmap: &'a HeightmapGrid,
    pub biomes: &'a BiomeMap,
    pub hydrology: &'a HydrologyGraph,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OreVein {
    pub id: u32,
    /// Index into [`ResourceSet::resource_types`].
    pub resource: u16,
    pub center: GridPos,
    pub richness: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub position: GridPos,
    pub resource: u16,
    pub category: ResourceCategory,
    pub yield_amount: f64,
    /// `yield × richness`.
    pub score: f64,
    pub vein: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub resource_types: Vec<String>,
    pub veins: Vec<OreVein>,
    pub nodes: Vec<ResourceNode>,
}

impl ResourceSet {
    pub fn nodes_of(&self, name: &str) -> impl Iterator<Item = &ResourceNode> {
        let id = self.resource_types.iter().position(|n| n == name);
        self.nodes
            .iter()
            .filter(move |n| Some(n.resource as usize) == id)
    }
}

pub struct ResourceDistributor<'a> {
    seed: u64,
    table: &'a ResourceTable,
}

impl<'a> ResourceDistributor<'a> {
    pub fn new(seed: u64, table: &'a ResourceTable) -> Self {
        Self { seed, table }
    }

    pub fn distribute(&self, world: &ResourceInput<'_>, ctx: &StageContext) -> Result<ResourceSet, StageError> {
        let extent = world.heightmap.extent();
        let size = self.table.stratum_size;
        let strata_x = extent.width.div_ceil(size);
        let strata_y = extent.height.div_ceil(size);
        let count = strata_x as usize * strata_y as usize;

        let per_stratum = (0..count)
            .into_par_iter()
            .map(|k| {
                ctx.check()?;
                let (kx, ky) = (k as u32 % strata_x, k as u32 / strata_x);
                Ok(self.sample_stratum(world, k as u64, kx * size, ky * size))
            })
            .collect::<Result<Vec<_>, StageError>>()?;

        let mut set = ResourceSet {
            resource_types: self.table.names(),
            ..Default::default()
        };
        for veins in per_stratum {
            for (mut vein, nodes) in veins {
                let id = set.veins.len() as u32;
                vein.id = id;
                set.nodes
                    .extend(nodes.into_iter().map(|node| ResourceNode { vein: id, ..node }));
                set.veins.push(vein);
            }
        }
        ctx.report(1.0);
        tracing::debug!(
            strata = count,
            veins = set.veins.len(),
            nodes = set.nodes.len(),
            "Resources distributed"
        );
        Ok(set)
    }

    fn sample_stratum(
        &self,
        world: &ResourceInput<'_>,
        stratum: u64,
        x0: u32,
        y0: u32,
    ) -> Vec<(OreVein, Vec<ResourceNode>)> {
        let extent = world.heightmap.extent();
        let size = self.table.stratum_size;
        let w = size.min(extent.width - x0);
        let h = size.min(extent.height - y0);
        let mut rng = unit_rng(self.seed, StageTag::Resources, stratum);
        let mut veins = Vec::new();

        for (r, compiled) in self.table.rules.iter().enumerate() {
            let rule = &compiled.rule;
            let center = GridPos::new(x0 + rng.random_range(0..w), y0 + rng.random_range(0..h));
            let roll = rng.random::<f64>();
            if !compiled.eligible(world, center)
                || roll >= rule.probability * compiled.multiplier(world.biomes, center)
            {
                continue;
            }

            let (lo, hi) = rule.richness_range;
            let richness = rng.random_range(lo..=hi);
            let mut nodes = Vec::with_capacity(rule.nodes_per_vein as usize);
            for _ in 0..rule.nodes_per_vein {
                let angle = rng.random_range(0.0..TAU);
                let dist = rule.vein_radius * det_sqrt(rng.random::<f64>());
                let x = (center.x as f64 + dist * det_cos(angle)).round();
                let y = (center.y as f64 + dist * det_sin(angle)).round();
                let yield_amount = rule.yield_distribution.sample(&mut rng) * richness;
                if !extent.contains(x as i64, y as i64) {
                    continue;
                }
                let position = GridPos::new(x as u32, y as u32);
                if !compiled.eligible(world, position) {
                    continue;
                }
                nodes.push(ResourceNode {
                    position,
                    resource: r as u16,
                    category: rule.category,
                    yield_amount,
                    score: yield_amount * richness,
                    vein: 0,
                });
            }
            veins.push((
                OreVein {
                    id: 0,
                    resource: r as u16,
                    center,
                    richness,
                },
                nodes,
            ));
        }
        veins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biome::BiomeRuleTable;
    use crate::grid::Extent;
    use crate::hydrology::{HydrologyConfig, HydrologyRouter};

    struct World {
        heightmap: HeightmapGrid,
        biomes: BiomeMap,
        hydrology: HydrologyGraph,
        table: BiomeTable,
    }

    impl World {
        fn new(heightmap: HeightmapGrid, biomes: BiomeMap, hydrology: HydrologyConfig) -> Self {
            let hydrology = HydrologyRouter::new(hydrology)
                .route(&heightmap, &StageContext::detached())
                .unwrap();
            Self {
                heightmap,
                biomes,
                hydrology,
                table: BiomeRuleTable::default().compile().unwrap(),
            }
        }

        fn input(&self) -> ResourceInput<'_> {
            ResourceInput {
                heightmap: &self.heightmap,
                biomes: &self.biomes,
                hydrology: &self.hydrology,
            }
        }

        fn id(&self, biome: &str) -> crate::biome::BiomeId {
            self.table.registry().lookup_by_name(biome).unwrap()
        }
    }

    fn flat(extent: Extent, elevation: f64) -> HeightmapGrid {
        HeightmapGrid::from_elevations(extent, vec![elevation; extent.cell_count()], 1.0, 100.0)
            .unwrap()
    }

    fn world(elevation: f64, biome: &str) -> World {
        let extent = Extent::new(128, 128);
        let table = BiomeRuleTable::default().compile().unwrap();
        let id = table.registry().lookup_by_name(biome).unwrap();
        World::new(
            flat(extent, elevation),
            BiomeMap::uniform(extent, id).unwrap(),
            HydrologyConfig::default(),
        )
    }

    fn distribute(seed: u64, config: &ResourceConfig, world: &World) -> ResourceSet {
        let table = config.compile(&world.table).unwrap();
        ResourceDistributor::new(seed, &table)
            .distribute(&world.input(), &StageContext::detached())
            .unwrap()
    }

    fn dense_rule(name: &str) -> ResourceRule {
        ResourceRule {
            name: name.into(),
            probability: 1.0,
            nodes_per_vein: 24,
            vein_radius: 8.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_resources_deterministic() {
        let w = world(0.7, "mountain");
        let config = ResourceConfig::default();
        let a = distribute(42, &config, &w);
        let b = distribute(42, &config, &w);
        assert_eq!(a, b);
        assert!(!a.nodes.is_empty(), "Mountains should hold some resources");
    }

    #[test]
    fn test_different_seeds_differ() {
        let w = world(0.7, "mountain");
        let config = ResourceConfig::default();
        assert_ne!(distribute(1, &config, &w), distribute(2, &config, &w));
    }

    #[test]
    fn test_biome_multiplier_excludes_unlisted_biomes() {
        let w = world(0.7, "desert");
        let set = distribute(9, &ResourceConfig::default(), &w);
        assert_eq!(set.nodes_of("iron").count(), 0, "Iron is not listed for desert");
        assert_eq!(set.nodes_of("herbs").count(), 0, "Herbs are not listed for desert");
    }

    #[test]
    fn test_elevation_range_respected() {
        let w = world(0.2, "grassland");
        let set = distribute(9, &ResourceConfig::default(), &w);
        assert_eq!(set.nodes_of("coal").count(), 0, "Coal needs elevation >= 0.3");
        assert!(set.nodes_of("herbs").count() > 0);
    }

    #[test]
    fn test_yields_non_negative_and_scored() {
        let w = world(0.7, "forest");
        let config = ResourceConfig {
            resource_distribution_table: vec![ResourceRule {
                name: "wild".into(),
                probability: 1.0,
                yield_distribution: YieldDistribution::Normal { mean: 0.0, std_dev: 10.0 },
                ..Default::default()
            }],
            ..Default::default()
        };
        let set = distribute(3, &config, &w);
        assert_eq!(set.veins.len(), 16, "One vein per stratum at probability 1");
        for node in &set.nodes {
            assert!(node.yield_amount >= 0.0);
            let richness = set.veins[node.vein as usize].richness;
            assert!((node.score - node.yield_amount * richness).abs() < 1e-12);
        }
    }

    #[test]
    fn test_unknown_biome_rejected() {
        let table = BiomeRuleTable::default().compile().unwrap();
        let config = ResourceConfig {
            resource_distribution_table: vec![ResourceRule {
                biome_multipliers: multipliers(&[("lava", 1.0)]),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(config.compile(&table).unwrap_err(), ConfigError::UnknownBiome("lava".into()));
    }

    #[test]
    fn test_water_biome_multiplier_rejected() {
        let table = BiomeRuleTable::default().compile().unwrap();
        let config = ResourceConfig {
            resource_distribution_table: vec![ResourceRule {
                biome_multipliers: multipliers(&[("ocean", 1.0)]),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(config.compile(&table), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_nodes_stay_in_listed_biomes() {
        // Four-column stripes of forest and desert; veins are wide enough to
        // reach across several stripes.
        let extent = Extent::new(64, 64);
        let base = world(0.5, "forest");
        let (forest, desert) = (base.id("forest"), base.id("desert"));
        let ids = (0..extent.cell_count())
            .map(|i| if (i as u32 % extent.width / 4) % 2 == 0 { forest } else { desert })
            .collect();
        let w = World::new(
            flat(extent, 0.5),
            BiomeMap::from_ids(extent, ids).unwrap(),
            HydrologyConfig::default(),
        );
        let config = ResourceConfig {
            stratum_size: 16,
            resource_distribution_table: vec![ResourceRule {
                biome_multipliers: multipliers(&[("forest", 1.0), ("desert", 0.0)]),
                ..dense_rule("herbs")
            }],
        };
        let set = distribute(11, &config, &w);
        assert!(!set.nodes.is_empty(), "Forest stripes should receive herbs");
        for node in &set.nodes {
            assert_eq!(w.biomes.biome(node.position), forest, "Node at {:?} left the forest", node.position);
        }
    }

    #[test]
    fn test_nodes_respect_elevation_range_per_cell() {
        // Alternating rows of high and low ground under a high-only rule.
        let extent = Extent::new(64, 64);
        let elevations = (0..extent.cell_count())
            .map(|i| if (i as u32 / extent.width) % 2 == 0 { 0.7 } else { 0.2 })
            .collect();
        let heightmap = HeightmapGrid::from_elevations(extent, elevations, 1.0, 100.0).unwrap();
        let base = world(0.5, "mountain");
        let w = World::new(
            heightmap,
            BiomeMap::uniform(extent, base.id("mountain")).unwrap(),
            HydrologyConfig::default(),
        );
        let config = ResourceConfig {
            stratum_size: 16,
            resource_distribution_table: vec![ResourceRule {
                elevation_range: ValueRange::above(0.5),
                ..dense_rule("iron")
            }],
        };
        let set = distribute(4, &config, &w);
        assert!(!set.nodes.is_empty());
        for node in &set.nodes {
            assert_eq!(node.position.y % 2, 0, "Node at {:?} is on low ground", node.position);
        }
    }

    #[test]
    fn test_nodes_avoid_lake_cells() {
        // A forest plain with a square basin that pools into a lake.
        let extent = Extent::new(64, 64);
        let mut elevations = vec![0.5; extent.cell_count()];
        for y in 26..38 {
            for x in 26..38 {
                elevations[extent.index(GridPos::new(x, y))] = 0.3;
            }
        }
        elevations[extent.index(GridPos::new(32, 32))] = 0.29;
        let heightmap = HeightmapGrid::from_elevations(extent, elevations, 1.0, 100.0).unwrap();
        let base = world(0.5, "forest");
        let w = World::new(
            heightmap,
            BiomeMap::uniform(extent, base.id("forest")).unwrap(),
            HydrologyConfig {
                lake_pooling_threshold: 4,
                ..Default::default()
            },
        );
        assert!(w.hydrology.is_lake(GridPos::new(32, 32)), "The basin should hold a lake");

        let config = ResourceConfig {
            stratum_size: 8,
            resource_distribution_table: vec![dense_rule("herbs")],
        };
        let table = config.compile(&w.table).unwrap();
        let set = ResourceDistributor::new(2, &table)
            .distribute(&w.input(), &StageContext::detached())
            .unwrap();
        assert!(!set.nodes.is_empty());
        for node in &set.nodes {
            assert!(!w.hydrology.is_water(node.position), "Node at {:?} is in water", node.position);
            assert!(table.is_eligible(node.resource as usize, &w.input(), node.position));
        }
    }
}
