//! Road network: A* routing over a terrain cost field, joined into a
//! spanning network over points of interest.
//!
//! POI pairs are considered shortest-first (Kruskal order); a pair is routed
//! only when its endpoints are not yet connected. POIs the network cannot
//! reach are reported instead of silently dropped.

use glam::DVec2;
use pathfinding::prelude::astar;
use serde::{Deserialize, Serialize};

use crate::biome::{BiomeMap, BiomeTable};
use crate::error::{ConfigError, StageError};
use crate::grid::{Extent, GridPos, neighbor_distance};
use crate::heightmap::HeightmapGrid;
use crate::hydrology::HydrologyGraph;
use crate::poi::{PoiId, PoiRecord};
use crate::stage::StageContext;

/// Integer cost units per unit of traversal cost.
const COST_SCALE: f64 = 1_000.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadConfig {
    /// Cost per cell of vertical rise (rise measured in cell widths).
    pub slope_weight: f64,
    /// Added when stepping onto a river cell.
    pub river_crossing_penalty: f64,
    /// Added when stepping onto a lake cell.
    pub lake_crossing_penalty: f64,
    /// Extra routing passes with relaxed passability while POIs stay unreachable.
    pub road_relax_attempts: u32,
    /// Impassable biomes cost `max_cost × relax_multiplier / level` once relaxed.
    pub relax_multiplier: f64,
    /// Catmull-Rom samples per path segment of the smoothed polyline.
    pub smoothing_subdivisions: u32,
}

impl Default for RoadConfig {
    fn default() -> Self {
        Self {
            slope_weight: 2.0,
            river_crossing_penalty: 25.0,
            lake_crossing_penalty: 200.0,
            road_relax_attempts: 2,
            relax_multiplier: 8.0,
            smoothing_subdivisions: 4,
        }
    }
}

impl RoadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("roads.slope_weight", self.slope_weight),
            ("roads.river_crossing_penalty", self.river_crossing_penalty),
            ("roads.lake_crossing_penalty", self.lake_crossing_penalty),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(field, "must be finite and non-negative"));
            }
        }
        if !self.relax_multiplier.is_finite() || self.relax_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "roads.relax_multiplier",
                "must be finite and at least 1",
            ));
        }
        Ok(())
    }
}

/// Inclusive index range of `RoadEdge::path` that crosses water.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoadEdge {
    pub from: PoiId,
    pub to: PoiId,
    /// Total traversal cost.
    pub cost: f64,
    /// Cells from `from` to `to`, inclusive.
    pub path: Vec<GridPos>,
    pub bridges: Vec<BridgeSpan>,
    /// Smoothed path in world units.
    pub polyline: Vec<DVec2>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoadGraph {
    pub nodes: Vec<PoiId>,
    pub edges: Vec<RoadEdge>,
    /// POIs outside the component holding the most POIs.
    pub unreachable: Vec<PoiId>,
    /// Passability relaxation level the network was built with.
    pub relax_level: u32,
}

impl RoadGraph {
    pub fn is_fully_connected(&self) -> bool {
        self.unreachable.is_empty()
    }

    /// Per-cell mask of road path cells.
    pub fn road_mask(&self, extent: Extent) -> Vec<bool> {
        let mut mask = vec![false; extent.cell_count()];
        for edge in &self.edges {
            for &pos in &edge.path {
                mask[extent.index(pos)] = true;
            }
        }
        mask
    }

    /// Connected components of the network, each sorted, ordered by first id.
    pub fn components(&self) -> Vec<Vec<PoiId>> {
        let mut sets = DisjointSet::new(self.nodes.len());
        let slot = |id: PoiId| self.nodes.iter().position(|n| *n == id);
        for edge in &self.edges {
            if let (Some(a), Some(b)) = (slot(edge.from), slot(edge.to)) {
                sets.union(a, b);
            }
        }
        group_components(&self.nodes, &mut sets)
    }
}

/// Union-find over POI slots.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns false when already joined.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[hi] = lo;
        true
    }
}

fn group_components(nodes: &[PoiId], sets: &mut DisjointSet) -> Vec<Vec<PoiId>> {
    let mut groups: Vec<(usize, Vec<PoiId>)> = Vec::new();
    for (slot, &id) in nodes.iter().enumerate() {
        let root = sets.find(slot);
        match groups.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(id),
            None => groups.push((root, vec![id])),
        }
    }
    let mut components: Vec<Vec<PoiId>> = groups
        .into_iter()
        .map(|(_, mut members)| {
            members.sort();
            members
        })
        .collect();
    components.sort_by_key(|c| c[0]);
    components
}

/// Inputs the router reads.
pub struct RoadInput<'a> {
    pub heightmap: &'a HeightmapGrid,
    pub biomes: &'a BiomeMap,
    pub hydrology: &'a HydrologyGraph,
    pub pois: &'a [PoiRecord],
}

pub struct RoadRouter<'a> {
    config: &'a RoadConfig,
    table: &'a BiomeTable,
}

struct CostField {
    extent: Extent,
    /// Per-cell biome cost; `None` is impassable.
    biome_cost: Vec<Option<f64>>,
    /// Per-cell water penalty.
    penalty: Vec<f64>,
    elevation: Vec<f64>,
    elevation_scale: f64,
    slope_weight: f64,
    min_cost: f64,
}

impl CostField {
    fn step_cost(&self, from: usize, to: usize, dir: usize) -> Option<u64> {
        let cost = self.biome_cost[to]?;
        let rise = (self.elevation[to] - self.elevation[from]).abs() * self.elevation_scale;
        let total = neighbor_distance(dir) * cost + self.slope_weight * rise + self.penalty[to];
        Some((total * COST_SCALE).ceil() as u64)
    }

    fn heuristic(&self, a: GridPos, b: GridPos) -> u64 {
        (a.distance(b) * self.min_cost * COST_SCALE).floor() as u64
    }

    fn successors(&self, pos: GridPos) -> Vec<(GridPos, u64)> {
        let from = self.extent.index(pos);
        self.extent
            .neighbors(pos)
            .filter_map(|(dir, n)| {
                self.step_cost(from, self.extent.index(n), dir)
                    .map(|c| (n, c))
            })
            .collect()
    }
}

impl<'a> RoadRouter<'a> {
    pub fn new(config: &'a RoadConfig, table: &'a BiomeTable) -> Self {
        Self { config, table }
    }

    fn cost_field(&self, input: &RoadInput<'_>, relax_level: u32) -> CostField {
        let extent = input.heightmap.extent();
        let max_cost = self.table.max_road_cost().unwrap_or(1.0);
        let relaxed = (relax_level > 0)
            .then(|| max_cost * self.config.relax_multiplier / relax_level as f64);
        let per_biome: Vec<Option<f64>> = self
            .table
            .registry()
            .iter()
            .map(|(_, def)| def.road_cost.or(relaxed))
            .collect();
        let min_cost = per_biome
            .iter()
            .flatten()
            .copied()
            .reduce(f64::min)
            .unwrap_or(1.0);

        let n = extent.cell_count();
        let mut biome_cost = Vec::with_capacity(n);
        let mut penalty = Vec::with_capacity(n);
        for i in 0..n {
            let pos = extent.pos(i);
            biome_cost.push(per_biome[input.biomes.biome(pos).0 as usize]);
            penalty.push(if input.hydrology.is_lake(pos) {
                self.config.lake_crossing_penalty
            } else if input.hydrology.is_river(pos) {
                self.config.river_crossing_penalty
            } else {
                0.0
            });
        }
        CostField {
            extent,
            biome_cost,
            penalty,
            elevation: input.heightmap.elevations().to_vec(),
            elevation_scale: input.heightmap.vertical_scale() / input.heightmap.cell_size(),
            slope_weight: self.config.slope_weight,
            min_cost,
        }
    }

    /// Cheapest path between two cells, with its cost in traversal units.
    pub fn find_path(
        &self,
        input: &RoadInput<'_>,
        from: GridPos,
        to: GridPos,
        relax_level: u32,
    ) -> Option<(Vec<GridPos>, f64)> {
        let field = self.cost_field(input, relax_level);
        route_pair(&field, from, to)
    }

    /// Build the POI network at the given relaxation level.
    pub fn build(
        &self,
        input: &RoadInput<'_>,
        relax_level: u32,
        ctx: &StageContext,
    ) -> Result<RoadGraph, StageError> {
        let nodes: Vec<PoiId> = input.pois.iter().map(|p| p.id).collect();
        let mut graph = RoadGraph {
            nodes,
            relax_level,
            ..Default::default()
        };
        if input.pois.len() < 2 {
            return Ok(graph);
        }
        let field = self.cost_field(input, relax_level);

        let mut pairs: Vec<(u64, usize, usize)> = Vec::new();
        for a in 0..input.pois.len() {
            for b in a + 1..input.pois.len() {
                let d = input.pois[a].position.distance_sq(input.pois[b].position) as u64;
                pairs.push((d, a, b));
            }
        }
        pairs.sort_unstable();

        let mut sets = DisjointSet::new(input.pois.len());
        let total = pairs.len();
        for (done, &(_, a, b)) in pairs.iter().enumerate() {
            ctx.check()?;
            ctx.report_every(done + 1, total, 8);
            if sets.find(a) == sets.find(b) {
                continue;
            }
            let (pa, pb) = (&input.pois[a], &input.pois[b]);
            if let Some((path, cost)) = route_pair(&field, pa.position, pb.position) {
                sets.union(a, b);
                let bridges = bridge_spans(&path, input.hydrology);
                let polyline = smooth_path(
                    &path,
                    input.heightmap.origin(),
                    input.heightmap.cell_size(),
                    self.config.smoothing_subdivisions,
                );
                graph.edges.push(RoadEdge {
                    from: pa.id,
                    to: pb.id,
                    cost,
                    path,
                    bridges,
                    polyline,
                });
            }
        }

        let components = group_components(&graph.nodes, &mut sets);
        let main = components
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
            .map(|(i, _)| i)
            .unwrap_or(0);
        graph.unreachable = components
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != main)
            .flat_map(|(_, c)| c)
            .collect();
        graph.unreachable.sort();

        tracing::debug!(
            edges = graph.edges.len(),
            unreachable = graph.unreachable.len(),
            relax_level,
            "Road network built"
        );
        Ok(graph)
    }
}

fn route_pair(field: &CostField, from: GridPos, to: GridPos) -> Option<(Vec<GridPos>, f64)> {
    if field.biome_cost[field.extent.index(from)].is_none()
        || field.biome_cost[field.extent.index(to)].is_none()
    {
        return None;
    }
    astar(
        &from,
        |&p| field.successors(p),
        |&p| field.heuristic(p, to),
        |&p| p == to,
    )
    .map(|(path, cost)| (path, cost as f64 / COST_SCALE))
}

/// Maximal runs of river or lake cells along a path.
pub fn bridge_spans(path: &[GridPos], hydrology: &HydrologyGraph) -> Vec<BridgeSpan> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, &pos) in path.iter().enumerate() {
        match (hydrology.is_water(pos), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                spans.push(BridgeSpan { start: s, end: i - 1 });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push(BridgeSpan {
            start: s,
            end: path.len() - 1,
        });
    }
    spans
}

/// Catmull-Rom spline through the cell centres, in world units.
pub fn smooth_path(
    path: &[GridPos],
    origin: (i64, i64),
    cell_size: f64,
    subdivisions: u32,
) -> Vec<DVec2> {
    let points: Vec<DVec2> = path
        .iter()
        .map(|p| {
            DVec2::new(
                (origin.0 + p.x as i64) as f64 * cell_size,
                (origin.1 + p.y as i64) as f64 * cell_size,
            )
        })
        .collect();
    if points.len() < 3 || subdivisions < 2 {
        return points;
    }
    let last = points.len() - 1;
    let mut out = Vec::with_capacity(last * subdivisions as usize + 1);
    for i in 0..last {
        let p0 = points[i.saturating_sub(1)];
        let p1 = points[i];
        let p2 = points[i + 1];
        let p3 = points[(i + 2).min(last)];
        for s in 0..subdivisions {
            let t = s as f64 / subdivisions as f64;
            out.push(catmull_rom(p0, p1, p2, p3, t));
        }
    }
    out.push(points[last]);
    out
}

fn catmull_rom(p0: DVec2, p1: DVec2, p2: DVec2, p3: DVec2, t: f64) -> DVec2 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * ((2.0 * p1)
        + (p2 - p0) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (3.0 * p1 - p0 - 3.0 * p2 + p3) * t3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biome::{BiomeDef, BiomeId, BiomeRule, BiomeRuleTable};
    use crate::hydrology::{HydrologyConfig, HydrologyRouter};
    use crate::poi::PoiCategory;

    /// Two biomes: passable "land" (id 0) and impassable "cliff" (id 1).
    fn table() -> BiomeTable {
        BiomeRuleTable {
            biomes: vec![
                BiomeDef::new("land", Some(1.0), 1.0, [0, 0, 0]),
                BiomeDef::new("cliff", None, 0.0, [0, 0, 0]),
            ],
            rules: vec![BiomeRule {
                biome: "land".into(),
                ..Default::default()
            }],
            fallback: "land".into(),
        }
        .compile()
        .unwrap()
    }

    fn poi(id: u32, x: u32, y: u32) -> PoiRecord {
        PoiRecord {
            id: PoiId(id),
            position: GridPos::new(x, y),
            category: PoiCategory::Camp,
            score: 0.0,
            difficulty: 0.0,
        }
    }

    struct World {
        heightmap: HeightmapGrid,
        biomes: BiomeMap,
        hydrology: HydrologyGraph,
    }

    /// Flat world with an impassable wall at column `wall_x` (if any).
    fn world(size: u32, wall_x: Option<u32>) -> World {
        let extent = Extent::new(size, size);
        let heightmap =
            HeightmapGrid::from_elevations(extent, vec![0.5; extent.cell_count()], 1.0, 10.0)
                .unwrap();
        let ids = (0..extent.cell_count())
            .map(|i| {
                if Some(extent.pos(i).x) == wall_x {
                    BiomeId(1)
                } else {
                    BiomeId(0)
                }
            })
            .collect();
        let biomes = BiomeMap::from_ids(extent, ids).unwrap();
        let hydrology = HydrologyRouter::new(HydrologyConfig::default())
            .route(&heightmap, &StageContext::detached())
            .unwrap();
        World {
            heightmap,
            biomes,
            hydrology,
        }
    }

    #[test]
    fn test_straight_path_cost_on_flat_ground() {
        let w = world(16, None);
        let table = table();
        let config = RoadConfig::default();
        let router = RoadRouter::new(&config, &table);
        let input = RoadInput {
            heightmap: &w.heightmap,
            biomes: &w.biomes,
            hydrology: &w.hydrology,
            pois: &[],
        };
        let (path, cost) = router
            .find_path(&input, GridPos::new(1, 5), GridPos::new(9, 5), 0)
            .unwrap();
        assert_eq!(path.len(), 9);
        assert!((cost - 8.0).abs() < 1e-9, "cost was {cost}");
    }

    #[test]
    fn test_network_connects_all_pois() {
        let w = world(32, None);
        let table = table();
        let config = RoadConfig::default();
        let pois = [poi(0, 2, 2), poi(1, 28, 3), poi(2, 15, 27), poi(3, 5, 20)];
        let graph = RoadRouter::new(&config, &table)
            .build(
                &RoadInput {
                    heightmap: &w.heightmap,
                    biomes: &w.biomes,
                    hydrology: &w.hydrology,
                    pois: &pois,
                },
                0,
                &StageContext::detached(),
            )
            .unwrap();
        assert!(graph.is_fully_connected());
        assert_eq!(graph.edges.len(), 3, "Spanning network over 4 POIs");
        assert_eq!(graph.components().len(), 1);
    }

    #[test]
    fn test_wall_reports_unreachable_subset() {
        let w = world(24, Some(12));
        let table = table();
        let config = RoadConfig::default();
        let pois = [poi(0, 2, 2), poi(1, 20, 3), poi(2, 4, 20), poi(3, 6, 10)];
        let input = RoadInput {
            heightmap: &w.heightmap,
            biomes: &w.biomes,
            hydrology: &w.hydrology,
            pois: &pois,
        };
        let router = RoadRouter::new(&config, &table);
        let strict = router.build(&input, 0, &StageContext::detached()).unwrap();
        assert_eq!(strict.unreachable, vec![PoiId(1)]);

        let relaxed = router.build(&input, 1, &StageContext::detached()).unwrap();
        assert!(relaxed.is_fully_connected(), "Relaxation should bridge the wall");
    }

    #[test]
    fn test_bridge_spans() {
        let extent = Extent::new(8, 1);
        let mut elevations = vec![0.5; 8];
        elevations[3] = 0.2;
        let heightmap = HeightmapGrid::from_elevations(extent, elevations, 1.0, 10.0).unwrap();
        let hydrology = HydrologyRouter::new(HydrologyConfig {
            river_flow_threshold: 2,
            ..Default::default()
        })
        .route(&heightmap, &StageContext::detached())
        .unwrap();
        let path: Vec<GridPos> = (0..8).map(|x| GridPos::new(x, 0)).collect();
        let spans = bridge_spans(&path, &hydrology);
        assert!(spans.iter().all(|s| s.start <= s.end));
        for span in spans {
            for i in span.start..=span.end {
                assert!(hydrology.is_water(path[i]));
            }
        }
    }

    #[test]
    fn test_smoothing_passes_through_endpoints() {
        let path = [GridPos::new(0, 0), GridPos::new(1, 1), GridPos::new(2, 1), GridPos::new(3, 3)];
        let line = smooth_path(&path, (10, 0), 2.0, 4);
        assert_eq!(line.len(), 3 * 4 + 1);
        assert_eq!(line[0], DVec2::new(20.0, 0.0));
        assert_eq!(*line.last().unwrap(), DVec2::new(26.0, 6.0));
        assert_eq!(line[4], DVec2::new(22.0, 2.0), "Spline passes through control points");
    }
}
