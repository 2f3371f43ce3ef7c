//! Cave networks grown by constrained random walks from surface entrances.
//!
//! Each entrance seeds one system with its own substream. The walk steers with
//! 3D simplex noise plus seeded jitter, keeps every waypoint under at least
//! `min_cover` of rock and spawns side branches whose root waypoints become
//! chambers. Systems grow in parallel and are merged in entrance order.

use std::collections::VecDeque;
use std::f64::consts::{FRAC_PI_2, TAU};

use glam::DVec3;
use noise::{NoiseFn, Simplex};
use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::biome::{BiomeMap, BiomeTable};
use crate::error::{ConfigError, StageError};
use crate::grid::GridPos;
use crate::heightmap::HeightmapGrid;
use crate::seed::{StageTag, derive_stage_seed, det_cos, det_sin, noise_seed, stage_rng, unit_rng};
use crate::spatial::{SpatialEntry, SpatialIndex};
use crate::stage::StageContext;

/// The entrance segment always dives at least this steeply, in degrees.
const ENTRANCE_MIN_DIVE: f64 = 45.0;
/// Added to the dive angle on each retry.
const RETRY_DIVE_STEP: f64 = 15.0;
const MAX_DIVE: f64 = 89.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaveConfig {
    /// Fraction of valid surface cells that become entrances.
    pub cave_entrance_density: f64,
    pub max_entrances: u32,
    /// Minimum distance between entrances, in cells.
    pub entrance_spacing: f64,
    /// Normalized elevation bounds for entrance cells.
    pub min_entrance_elevation: f64,
    pub max_entrance_elevation: f64,
    /// Degrees.
    pub max_entrance_slope: f64,
    /// Segment length bounds in world units.
    pub min_segment_length: f64,
    pub max_segment_length: f64,
    /// Dive angle bounds in degrees; negative values climb.
    pub min_dive_degrees: f64,
    pub max_dive_degrees: f64,
    /// Heading perturbation per segment, in radians.
    pub wander: f64,
    pub branch_probability: f64,
    pub max_segments_per_system: u32,
    /// Segments a single branch may grow before it ends.
    pub max_branch_segments: u32,
    /// Rock required above every waypoint, in world units.
    pub min_cover: f64,
    /// Waypoints are clamped to this depth below the surface.
    pub max_depth: f64,
    pub tunnel_radius: f64,
    /// Radius multiplier for waypoints where a branch splits off.
    pub chamber_scale: f64,
    pub max_retries: u32,
    pub noise_frequency: f64,
}

impl Default for CaveConfig {
    fn default() -> Self {
        Self {
            cave_entrance_density: 0.0005,
            max_entrances: 8,
            entrance_spacing: 24.0,
            min_entrance_elevation: 0.45,
            max_entrance_elevation: 0.9,
            max_entrance_slope: 40.0,
            min_segment_length: 8.0,
            max_segment_length: 16.0,
            min_dive_degrees: -10.0,
            max_dive_degrees: 35.0,
            wander: 0.6,
            branch_probability: 0.2,
            max_segments_per_system: 48,
            max_branch_segments: 12,
            min_cover: 4.0,
            max_depth: 120.0,
            tunnel_radius: 2.0,
            chamber_scale: 2.5,
            max_retries: 3,
            noise_frequency: 0.05,
        }
    }
}

impl CaveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.cave_entrance_density) {
            return Err(ConfigError::invalid("caves.cave_entrance_density", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.branch_probability) {
            return Err(ConfigError::invalid("caves.branch_probability", "must be in [0, 1]"));
        }
        if self.min_entrance_elevation > self.max_entrance_elevation {
            return Err(ConfigError::invalid(
                "caves.min_entrance_elevation",
                "must not exceed max_entrance_elevation",
            ));
        }
        if !(self.min_segment_length > 0.0 && self.min_segment_length <= self.max_segment_length) {
            return Err(ConfigError::invalid(
                "caves.min_segment_length",
                "must be positive and not exceed max_segment_length",
            ));
        }
        if !(-MAX_DIVE..=MAX_DIVE).contains(&self.min_dive_degrees)
            || !(-MAX_DIVE..=MAX_DIVE).contains(&self.max_dive_degrees)
            || self.min_dive_degrees > self.max_dive_degrees
        {
            return Err(ConfigError::invalid(
                "caves.dive_degrees",
                "bounds must be ordered and within [-89, 89]",
            ));
        }
        if self.min_cover < 0.0 || self.max_depth <= self.min_cover {
            return Err(ConfigError::invalid(
                "caves.max_depth",
                "must exceed a non-negative min_cover",
            ));
        }
        if self.tunnel_radius <= 0.0 || self.chamber_scale < 1.0 {
            return Err(ConfigError::invalid(
                "caves.tunnel_radius",
                "radius must be positive and chamber_scale at least 1",
            ));
        }
        if self.entrance_spacing < 0.0 || !self.wander.is_finite() {
            return Err(ConfigError::invalid(
                "caves.entrance_spacing",
                "spacing must be non-negative and wander finite",
            ));
        }
        Ok(())
    }
}

/// Waypoint of a cave network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaveNode {
    pub id: u32,
    /// x/y in cells, z = depth below the surface at x/y in world units.
    pub position: DVec3,
    pub radius: f64,
    pub is_entrance: bool,
    /// Index of the system (entrance) this node belongs to.
    pub system: u32,
}

/// Tunnel between two nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaveSegment {
    pub from: u32,
    pub to: u32,
    pub radius: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaveNetwork {
    pub nodes: Vec<CaveNode>,
    pub segments: Vec<CaveSegment>,
    pub entrances: Vec<u32>,
}

impl CaveNetwork {
    pub fn entrance_positions(&self) -> impl Iterator<Item = GridPos> + '_ {
        self.entrances.iter().map(|&id| {
            let p = self.nodes[id as usize].position;
            GridPos::new(p.x as u32, p.y as u32)
        })
    }

    /// Breadth-first search from every entrance; fails if any node is left over.
    pub fn verify_connectivity(&self) -> Result<(), String> {
        let mut adjacency = vec![Vec::new(); self.nodes.len()];
        for segment in &self.segments {
            let (a, b) = (segment.from as usize, segment.to as usize);
            if a >= self.nodes.len() || b >= self.nodes.len() {
                return Err(format!("segment {a}->{b} references a missing node"));
            }
            adjacency[a].push(b);
            adjacency[b].push(a);
        }

        let mut seen = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> = VecDeque::new();
        for &entrance in &self.entrances {
            let e = entrance as usize;
            if e < seen.len() && !seen[e] {
                seen[e] = true;
                queue.push_back(e);
            }
        }
        while let Some(node) = queue.pop_front() {
            for &next in &adjacency[node] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }

        let unreachable = seen.iter().filter(|s| !**s).count();
        if unreachable == 0 {
            Ok(())
        } else {
            Err(format!("{unreachable} cave nodes unreachable from any entrance"))
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Waypoint {
    x: f64,
    y: f64,
    /// Absolute altitude in world units.
    altitude: f64,
    radius: f64,
}

#[derive(Default)]
struct CaveSystem {
    waypoints: Vec<Waypoint>,
    segments: Vec<(usize, usize)>,
}

pub struct CaveGenerator<'a> {
    seed: u64,
    config: &'a CaveConfig,
    table: &'a BiomeTable,
    noise: Simplex,
}

impl<'a> CaveGenerator<'a> {
    pub fn new(seed: u64, config: &'a CaveConfig, table: &'a BiomeTable) -> Self {
        Self {
            seed,
            config,
            table,
            noise: Simplex::new(noise_seed(derive_stage_seed(seed, StageTag::Caves))),
        }
    }

    /// Cells that may hold an entrance, in index order.
    fn valid_cells(&self, heightmap: &HeightmapGrid, biomes: &BiomeMap) -> Vec<GridPos> {
        let extent = heightmap.extent();
        let cfg = self.config;
        (0..extent.cell_count())
            .filter(|&i| {
                let def = self.table.def(biomes.biome_at_index(i));
                let elevation = heightmap.elevation_at_index(i);
                def.allows_caves
                    && !def.is_water
                    && elevation >= cfg.min_entrance_elevation
                    && elevation <= cfg.max_entrance_elevation
            })
            .map(|i| extent.pos(i))
            .filter(|&pos| heightmap.slope_degrees(pos) <= cfg.max_entrance_slope)
            .collect()
    }

    /// Seeded shuffle of valid cells, then greedy acceptance with spacing.
    pub fn select_entrances(&self, heightmap: &HeightmapGrid, biomes: &BiomeMap) -> Vec<GridPos> {
        let mut valid = self.valid_cells(heightmap, biomes);
        let target = ((self.config.cave_entrance_density * valid.len() as f64).round() as usize)
            .min(self.config.max_entrances as usize);
        if target == 0 {
            return Vec::new();
        }

        let mut rng = stage_rng(self.seed, StageTag::Caves);
        valid.shuffle(&mut rng);
        let mut index = SpatialIndex::new(self.config.entrance_spacing);
        let mut chosen = Vec::with_capacity(target);
        for pos in valid {
            let (x, y) = (pos.x as f64, pos.y as f64);
            if index.any_within(x, y, self.config.entrance_spacing) {
                continue;
            }
            index.insert(SpatialEntry::new(x, y, 0.0));
            chosen.push(pos);
            if chosen.len() == target {
                break;
            }
        }
        chosen
    }

    pub fn generate(
        &self,
        heightmap: &HeightmapGrid,
        biomes: &BiomeMap,
        ctx: &StageContext,
    ) -> Result<CaveNetwork, StageError> {
        ctx.check()?;
        let entrances = self.select_entrances(heightmap, biomes);
        let systems = entrances
            .par_iter()
            .enumerate()
            .map(|(i, &entrance)| {
                ctx.check()?;
                Ok(self.grow_system(heightmap, i as u64, entrance))
            })
            .collect::<Result<Vec<_>, StageError>>()?;

        let mut network = CaveNetwork::default();
        for (system_id, system) in systems.into_iter().enumerate() {
            let offset = network.nodes.len() as u32;
            network.entrances.push(offset);
            for (i, w) in system.waypoints.iter().enumerate() {
                let depth = if i == 0 {
                    0.0
                } else {
                    heightmap.altitude_at(w.x, w.y) - w.altitude
                };
                network.nodes.push(CaveNode {
                    id: offset + i as u32,
                    position: DVec3::new(w.x, w.y, depth),
                    radius: w.radius,
                    is_entrance: i == 0,
                    system: system_id as u32,
                });
            }
            network
                .segments
                .extend(system.segments.iter().map(|&(a, b)| CaveSegment {
                    from: offset + a as u32,
                    to: offset + b as u32,
                    radius: self.config.tunnel_radius,
                }));
        }

        tracing::debug!(
            entrances = network.entrances.len(),
            nodes = network.nodes.len(),
            segments = network.segments.len(),
            "Cave networks grown"
        );
        Ok(network)
    }

    fn grow_system(&self, heightmap: &HeightmapGrid, system: u64, entrance: GridPos) -> CaveSystem {
        let cfg = self.config;
        let mut rng = unit_rng(self.seed, StageTag::Caves, system);
        let mut out = CaveSystem::default();
        out.waypoints.push(Waypoint {
            x: entrance.x as f64,
            y: entrance.y as f64,
            altitude: heightmap.altitude(entrance),
            radius: cfg.tunnel_radius,
        });

        let max_segments = cfg.max_segments_per_system as usize;
        let mut branches = vec![(0usize, rng.random_range(0.0..TAU))];
        'branches: while let Some((mut current, mut yaw)) = branches.pop() {
            for _ in 0..cfg.max_branch_segments {
                if out.segments.len() >= max_segments {
                    break 'branches;
                }
                let from = out.waypoints[current];
                let entrance_segment = out.segments.is_empty();

                let f = cfg.noise_frequency;
                let drift = self.noise.get([from.x * f, from.y * f, from.altitude * f]);
                yaw += drift * cfg.wander + rng.random_range(-0.5..=0.5) * cfg.wander;
                let length = rng.random_range(cfg.min_segment_length..=cfg.max_segment_length);
                let mut dive = if entrance_segment {
                    let lo = cfg.min_dive_degrees.max(ENTRANCE_MIN_DIVE);
                    let hi = cfg.max_dive_degrees.max(ENTRANCE_MIN_DIVE);
                    rng.random_range(lo..=hi)
                } else {
                    rng.random_range(cfg.min_dive_degrees..=cfg.max_dive_degrees)
                };

                let mut accepted = None;
                for _ in 0..=cfg.max_retries {
                    accepted = self.propose(heightmap, &from, yaw, dive, length, entrance_segment);
                    if accepted.is_some() {
                        break;
                    }
                    dive = (dive + RETRY_DIVE_STEP).min(MAX_DIVE);
                }
                let Some(next) = accepted else {
                    break;
                };

                out.waypoints.push(next);
                let id = out.waypoints.len() - 1;
                out.segments.push((current, id));
                current = id;

                if out.segments.len() < max_segments && rng.random::<f64>() < cfg.branch_probability {
                    out.waypoints[id].radius = cfg.tunnel_radius * cfg.chamber_scale;
                    let side = if rng.random::<bool>() { FRAC_PI_2 } else { -FRAC_PI_2 };
                    branches.push((id, yaw + side));
                }
            }
        }
        out
    }

    /// Candidate end waypoint, or `None` if it leaves the map or breaks cover.
    ///
    /// On the entrance segment, samples shallower than `min_cover` below the
    /// entrance are exempt from the cover check.
    fn propose(
        &self,
        heightmap: &HeightmapGrid,
        from: &Waypoint,
        yaw: f64,
        dive_degrees: f64,
        length: f64,
        entrance_segment: bool,
    ) -> Option<Waypoint> {
        let cfg = self.config;
        let extent = heightmap.extent();
        let max_x = (extent.width - 1) as f64;
        let max_y = (extent.height - 1) as f64;
        let inside = |x: f64, y: f64| (0.0..=max_x).contains(&x) && (0.0..=max_y).contains(&y);

        let dive = dive_degrees.to_radians();
        let horizontal = length * det_cos(dive) / heightmap.cell_size();
        let x = from.x + horizontal * det_cos(yaw);
        let y = from.y + horizontal * det_sin(yaw);
        if !inside(x, y) {
            return None;
        }
        let surface = heightmap.altitude_at(x, y);
        let altitude = (from.altitude - length * det_sin(dive)).max(surface - cfg.max_depth);
        if surface - altitude < cfg.min_cover {
            return None;
        }

        let steps = (horizontal.ceil() as usize).max(1);
        for s in 1..steps {
            let t = s as f64 / steps as f64;
            let sx = from.x + (x - from.x) * t;
            let sy = from.y + (y - from.y) * t;
            let sa = from.altitude + (altitude - from.altitude) * t;
            if entrance_segment && from.altitude - sa < cfg.min_cover {
                continue;
            }
            if heightmap.altitude_at(sx, sy) - sa < cfg.min_cover {
                return None;
            }
        }

        Some(Waypoint {
            x,
            y,
            altitude,
            radius: cfg.tunnel_radius,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biome::{BiomeDef, BiomeId, BiomeRule, BiomeRuleTable};
    use crate::grid::Extent;

    fn table() -> BiomeTable {
        BiomeRuleTable {
            biomes: vec![
                BiomeDef::new("hills", Some(1.0), 1.0, [0, 0, 0]),
                BiomeDef::new("marsh", Some(2.0), 0.5, [0, 0, 0]).without_caves(),
            ],
            rules: vec![BiomeRule {
                biome: "hills".into(),
                ..Default::default()
            }],
            fallback: "hills".into(),
        }
        .compile()
        .unwrap()
    }

    fn flat(size: u32, biome: BiomeId) -> (HeightmapGrid, BiomeMap) {
        let extent = Extent::new(size, size);
        let heightmap =
            HeightmapGrid::from_elevations(extent, vec![0.6; extent.cell_count()], 1.0, 400.0)
                .unwrap();
        (heightmap, BiomeMap::uniform(extent, biome).unwrap())
    }

    fn config() -> CaveConfig {
        CaveConfig {
            cave_entrance_density: 0.01,
            entrance_spacing: 20.0,
            ..Default::default()
        }
    }

    fn generate(seed: u64, size: u32, biome: BiomeId, config: &CaveConfig) -> CaveNetwork {
        let table = table();
        let (heightmap, biomes) = flat(size, biome);
        CaveGenerator::new(seed, config, &table)
            .generate(&heightmap, &biomes, &StageContext::detached())
            .unwrap()
    }

    #[test]
    fn test_network_connected_from_entrances() {
        let network = generate(7, 96, BiomeId(0), &config());
        assert!(!network.entrances.is_empty(), "Expected at least one entrance");
        assert!(!network.segments.is_empty(), "Expected tunnels to grow");
        network.verify_connectivity().unwrap();
    }

    #[test]
    fn test_waypoints_keep_cover_and_depth() {
        let cfg = config();
        let network = generate(11, 96, BiomeId(0), &cfg);
        for node in network.nodes.iter().filter(|n| !n.is_entrance) {
            assert!(
                node.position.z >= cfg.min_cover - 1e-9,
                "Node {} only {} below surface",
                node.id,
                node.position.z
            );
            assert!(node.position.z <= cfg.max_depth + 1e-9);
        }
    }

    #[test]
    fn test_entrance_segment_dives_steeply() {
        let network = generate(3, 96, BiomeId(0), &config());
        let firsts = network
            .entrances
            .iter()
            .filter_map(|&e| network.segments.iter().find(|s| s.from == e));
        for first in firsts {
            let a = network.nodes[first.from as usize].position;
            let b = network.nodes[first.to as usize].position;
            let horizontal = ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt();
            assert!(
                b.z - a.z >= horizontal - 1e-6,
                "Entrance segment dives shallower than 45 degrees"
            );
        }
    }

    #[test]
    fn test_caves_deterministic() {
        assert_eq!(generate(5, 64, BiomeId(0), &config()), generate(5, 64, BiomeId(0), &config()));
    }

    #[test]
    fn test_no_entrances_where_biome_forbids() {
        let network = generate(5, 64, BiomeId(1), &config());
        assert!(network.nodes.is_empty());
        network.verify_connectivity().unwrap();
    }

    #[test]
    fn test_entrances_respect_spacing() {
        let cfg = config();
        let network = generate(9, 128, BiomeId(0), &cfg);
        let positions: Vec<GridPos> = network.entrance_positions().collect();
        for (i, a) in positions.iter().enumerate() {
            for b in &positions[i + 1..] {
                assert!(a.distance(*b) >= cfg.entrance_spacing);
            }
        }
    }

    #[test]
    fn test_unreachable_node_detected() {
        let mut network = generate(7, 96, BiomeId(0), &config());
        network.nodes.push(CaveNode {
            id: network.nodes.len() as u32,
            position: DVec3::new(1.0, 1.0, 10.0),
            radius: 1.0,
            is_entrance: false,
            system: 0,
        });
        assert!(network.verify_connectivity().is_err());
    }
}
