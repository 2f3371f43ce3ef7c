//! Debug visualization of generation results.
//!
//! Renders a base layer (elevation or biomes) into a [`DebugImage`] and draws
//! the selected overlays on top. Encoding to an image format is left to the
//! caller.

mod image;
mod renderers;

pub use self::image::DebugImage;
pub use renderers::{
    height_to_color, overlay_caves, overlay_hydrology, overlay_placements, overlay_pois,
    overlay_resources, overlay_roads, poi_color, render_biomes, render_heightmap,
};

use serde::{Deserialize, Serialize};

use crate::biome::BiomeTable;
use crate::result::GenerationResult;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseLayer {
    Elevation,
    #[default]
    Biomes,
}

/// Which overlays to draw.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugLayers {
    pub base: BaseLayer,
    /// Elevations below this are drawn as water on the elevation layer.
    pub sea_level: f64,
    pub hydrology: bool,
    pub roads: bool,
    pub placements: bool,
    pub caves: bool,
    pub pois: bool,
    pub resources: bool,
}

impl Default for DebugLayers {
    fn default() -> Self {
        Self {
            base: BaseLayer::Biomes,
            sea_level: 0.18,
            hydrology: true,
            roads: true,
            placements: false,
            caves: true,
            pois: true,
            resources: false,
        }
    }
}

impl DebugLayers {
    /// Base layer only.
    pub fn base_only(base: BaseLayer) -> Self {
        Self {
            base,
            hydrology: false,
            roads: false,
            placements: false,
            caves: false,
            pois: false,
            resources: false,
            ..Default::default()
        }
    }

    pub fn any_overlay(&self) -> bool {
        self.hydrology || self.roads || self.placements || self.caves || self.pois || self.resources
    }
}

/// Render `result` with the given layers.
pub fn render(result: &GenerationResult, table: &BiomeTable, layers: &DebugLayers) -> DebugImage {
    let mut image = match layers.base {
        BaseLayer::Elevation => render_heightmap(&result.heightmap, layers.sea_level),
        BaseLayer::Biomes => render_biomes(&result.biomes, table, &result.heightmap),
    };
    if layers.hydrology {
        overlay_hydrology(&mut image, &result.hydrology);
    }
    if layers.roads {
        overlay_roads(&mut image, &result.roads);
    }
    if layers.placements {
        overlay_placements(&mut image, &result.placements);
    }
    if layers.resources {
        overlay_resources(&mut image, &result.resources);
    }
    if layers.caves {
        overlay_caves(&mut image, &result.caves);
    }
    if layers.pois {
        overlay_pois(&mut image, &result.pois.records);
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_only_has_no_overlays() {
        assert!(!DebugLayers::base_only(BaseLayer::Elevation).any_overlay());
        assert!(DebugLayers::default().any_overlay());
    }
}
