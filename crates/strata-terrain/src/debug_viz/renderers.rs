//! Base layers (heightmap, biomes) and overlays (water, roads, content).

use super::image::DebugImage;
use crate::biome::{BiomeMap, BiomeTable};
use crate::cave::CaveNetwork;
use crate::grid::GridPos;
use crate::heightmap::HeightmapGrid;
use crate::hydrology::HydrologyGraph;
use crate::placement::PlacementSet;
use crate::poi::{PoiCategory, PoiRecord};
use crate::resources::ResourceSet;
use crate::roads::RoadGraph;

const RIVER: [u8; 3] = [40, 110, 230];
const LAKE: [u8; 3] = [20, 60, 170];
const ROAD: [u8; 3] = [150, 90, 40];
const BRIDGE: [u8; 3] = [240, 240, 240];
const OBJECT: [u8; 3] = [10, 70, 20];
const STRUCTURE: [u8; 3] = [120, 60, 20];
const CAVE: [u8; 3] = [200, 40, 200];
const RESOURCE: [u8; 3] = [250, 200, 0];

/// Map a normalized elevation to a colour ramp.
///
/// Values below `sea_level` are shaded blue, the rest run green → brown →
/// white.
pub fn height_to_color(normalized: f64, sea_level: f64) -> [u8; 3] {
    let h = normalized.clamp(0.0, 1.0);
    if h < sea_level {
        let t = if sea_level > 0.0 { h / sea_level } else { 0.0 };
        [0, (40.0 + t * 60.0) as u8, (110.0 + t * 110.0) as u8]
    } else if h < 0.6 {
        let t = ((h - sea_level) / (0.6 - sea_level).max(1e-6)).clamp(0.0, 1.0);
        [(40.0 + t * 80.0) as u8, (160.0 - t * 40.0) as u8, (40.0 + t * 20.0) as u8]
    } else if h < 0.8 {
        let t = (h - 0.6) / 0.2;
        [(120.0 + t * 30.0) as u8, (120.0 - t * 40.0) as u8, (60.0 + t * 20.0) as u8]
    } else {
        let base = (150.0 + (h - 0.8) / 0.2 * 105.0) as u8;
        [base, base, base]
    }
}

pub fn render_heightmap(heightmap: &HeightmapGrid, sea_level: f64) -> DebugImage {
    let extent = heightmap.extent();
    let mut image = DebugImage::new(extent.width, extent.height);
    for (i, &h) in heightmap.elevations().iter().enumerate() {
        let pos = extent.pos(i);
        let [r, g, b] = height_to_color(h, sea_level);
        image.set_pixel(pos.x, pos.y, r, g, b, 255);
    }
    image
}

/// Biome colours from the table, lightly shaded by elevation.
pub fn render_biomes(biomes: &BiomeMap, table: &BiomeTable, heightmap: &HeightmapGrid) -> DebugImage {
    let extent = biomes.extent();
    let mut image = DebugImage::new(extent.width, extent.height);
    for i in 0..extent.cell_count() {
        let pos = extent.pos(i);
        let [r, g, b] = table.def(biomes.biome_at_index(i)).color;
        let shade = 0.75 + 0.25 * heightmap.elevation_at_index(i);
        let s = |c: u8| (c as f64 * shade).min(255.0) as u8;
        image.set_pixel(pos.x, pos.y, s(r), s(g), s(b), 255);
    }
    image
}

fn at(pos: GridPos) -> (i64, i64) {
    (pos.x as i64, pos.y as i64)
}

pub fn overlay_hydrology(image: &mut DebugImage, hydrology: &HydrologyGraph) {
    let extent = hydrology.extent();
    for i in 0..extent.cell_count() {
        let pos = extent.pos(i);
        if hydrology.is_lake(pos) {
            image.put(pos.x as i64, pos.y as i64, LAKE);
        } else if hydrology.is_river(pos) {
            image.put(pos.x as i64, pos.y as i64, RIVER);
        }
    }
}

pub fn overlay_roads(image: &mut DebugImage, roads: &RoadGraph) {
    for edge in &roads.edges {
        for pair in edge.path.windows(2) {
            image.line(at(pair[0]), at(pair[1]), ROAD);
        }
        for span in &edge.bridges {
            for &pos in &edge.path[span.start..=span.end.min(edge.path.len() - 1)] {
                let (x, y) = at(pos);
                image.put(x, y, BRIDGE);
            }
        }
    }
}

pub fn poi_color(category: PoiCategory) -> [u8; 3] {
    match category {
        PoiCategory::Settlement => [255, 255, 255],
        PoiCategory::Dungeon => [120, 0, 0],
        PoiCategory::Treasure => [255, 215, 0],
        PoiCategory::QuestLocation => [0, 200, 255],
        PoiCategory::BossArena => [255, 0, 0],
        PoiCategory::Camp => [255, 140, 0],
        PoiCategory::Ruins => [160, 160, 160],
    }
}

pub fn overlay_pois(image: &mut DebugImage, pois: &[PoiRecord]) {
    for poi in pois {
        let (x, y) = at(poi.position);
        image.marker(x, y, 2, [0, 0, 0]);
        image.marker(x, y, 1, poi_color(poi.category));
    }
}

pub fn overlay_placements(image: &mut DebugImage, placements: &PlacementSet) {
    for object in &placements.objects {
        let (x, y) = at(object.position);
        image.put(x, y, OBJECT);
    }
    for member in placements.structures.iter().flat_map(|g| &g.members) {
        let (x, y) = at(member.position);
        image.marker(x, y, 1, STRUCTURE);
    }
}

/// Tunnels projected onto the map plane, entrances as markers.
pub fn overlay_caves(image: &mut DebugImage, caves: &CaveNetwork) {
    let project = |id: u32| {
        let p = caves.nodes[id as usize].position;
        (p.x.round() as i64, p.y.round() as i64)
    };
    for segment in &caves.segments {
        image.line(project(segment.from), project(segment.to), CAVE);
    }
    for &entrance in &caves.entrances {
        let (x, y) = project(entrance);
        image.marker(x, y, 1, CAVE);
    }
}

pub fn overlay_resources(image: &mut DebugImage, resources: &ResourceSet) {
    for node in &resources.nodes {
        let (x, y) = at(node.position);
        image.put(x, y, RESOURCE);
    }
}
