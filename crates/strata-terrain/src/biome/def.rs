//! Biome definition: the per-biome metadata downstream stages consult.

use serde::{Deserialize, Serialize};

/// Full descriptor for a biome type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiomeDef {
    /// Unique biome name (e.g., "temperate_forest").
    pub name: String,
    /// Road traversal cost per cell. `None` marks the biome impassable.
    pub road_cost: Option<f64>,
    /// How attractive the biome is for points of interest, in `[0.0, 1.0]`.
    pub poi_desirability: f64,
    /// Whether cave entrances may open here.
    pub allows_caves: bool,
    /// Open water; excluded from placement, POIs and cave entrances.
    pub is_water: bool,
    /// RGB used by debug renderers.
    pub color: [u8; 3],
}

impl Default for BiomeDef {
    fn default() -> Self {
        Self {
            name: String::from("unnamed"),
            road_cost: Some(1.0),
            poi_desirability: 0.5,
            allows_caves: true,
            is_water: false,
            color: [128, 128, 128],
        }
    }
}

impl BiomeDef {
    /// Convenience constructor used by the built-in table.
    pub fn new(name: &str, road_cost: Option<f64>, poi_desirability: f64, color: [u8; 3]) -> Self {
        Self {
            name: name.to_string(),
            road_cost,
            poi_desirability,
            color,
            ..Default::default()
        }
    }

    pub fn water(mut self) -> Self {
        self.is_water = true;
        self.allows_caves = false;
        self
    }

    pub fn without_caves(mut self) -> Self {
        self.allows_caves = false;
        self
    }
}
