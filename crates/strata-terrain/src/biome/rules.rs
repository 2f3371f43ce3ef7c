//! Ordered biome rule table: maps (elevation, moisture, temperature) to a biome.

use serde::{Deserialize, Serialize};

use super::{BiomeDef, BiomeId, BiomeRegistry};
use crate::error::ConfigError;

/// Half-open interval `[min, max)` over a normalized input.
///
/// A `max` of 1.0 or more also admits the value 1.0 itself, so the top of the
/// normalized range is never orphaned.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    /// Matches every normalized value.
    pub const FULL: ValueRange = ValueRange { min: 0.0, max: 1.0 };

    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub const fn below(max: f64) -> Self {
        Self { min: 0.0, max }
    }

    pub const fn above(min: f64) -> Self {
        Self { min, max: 1.0 }
    }

    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && (v < self.max || (self.max >= 1.0 && v <= self.max))
    }

    fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::FULL
    }
}

/// One entry of the rule table. Unspecified ranges match everything.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiomeRule {
    pub biome: String,
    pub elevation: ValueRange,
    pub moisture: ValueRange,
    pub temperature: ValueRange,
}

impl Default for BiomeRule {
    fn default() -> Self {
        Self {
            biome: String::new(),
            elevation: ValueRange::FULL,
            moisture: ValueRange::FULL,
            temperature: ValueRange::FULL,
        }
    }
}

impl BiomeRule {
    fn new(biome: &str) -> Self {
        Self {
            biome: biome.to_string(),
            ..Default::default()
        }
    }

    fn elevation(mut self, range: ValueRange) -> Self {
        self.elevation = range;
        self
    }

    fn moisture(mut self, range: ValueRange) -> Self {
        self.moisture = range;
        self
    }

    fn temperature(mut self, range: ValueRange) -> Self {
        self.temperature = range;
        self
    }
}

/// Externally supplied rule table plus the biome definitions it references.
///
/// Rules are evaluated in order and the first match wins; cells that match no
/// rule receive `fallback`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiomeRuleTable {
    pub biomes: Vec<BiomeDef>,
    pub rules: Vec<BiomeRule>,
    pub fallback: String,
}

impl Default for BiomeRuleTable {
    fn default() -> Self {
        let biomes = vec![
            BiomeDef::new("ocean", None, 0.0, [28, 64, 140]).water(),
            BiomeDef::new("beach", Some(1.5), 0.5, [232, 214, 160]).without_caves(),
            BiomeDef::new("snow", Some(6.0), 0.1, [245, 245, 250]),
            BiomeDef::new("mountain", Some(4.0), 0.3, [128, 118, 108]),
            BiomeDef::new("tundra", Some(2.0), 0.2, [176, 190, 180]),
            BiomeDef::new("taiga", Some(1.8), 0.4, [70, 110, 90]),
            BiomeDef::new("desert", Some(2.0), 0.2, [220, 196, 120]),
            BiomeDef::new("savanna", Some(1.2), 0.6, [190, 180, 90]),
            BiomeDef::new("rainforest", Some(3.0), 0.4, [20, 110, 40]).without_caves(),
            BiomeDef::new("swamp", Some(4.0), 0.2, [70, 90, 60]).without_caves(),
            BiomeDef::new("forest", Some(1.6), 0.7, [40, 140, 60]),
            BiomeDef::new("grassland", Some(1.0), 1.0, [120, 180, 80]),
        ];
        let rules = vec![
            BiomeRule::new("ocean").elevation(ValueRange::below(0.18)),
            BiomeRule::new("beach").elevation(ValueRange::new(0.18, 0.22)),
            BiomeRule::new("snow").elevation(ValueRange::above(0.78)),
            BiomeRule::new("mountain").elevation(ValueRange::new(0.65, 0.78)),
            BiomeRule::new("tundra").temperature(ValueRange::below(0.2)),
            BiomeRule::new("taiga").temperature(ValueRange::new(0.2, 0.35)),
            BiomeRule::new("desert")
                .temperature(ValueRange::above(0.7))
                .moisture(ValueRange::below(0.25)),
            BiomeRule::new("savanna")
                .temperature(ValueRange::above(0.65))
                .moisture(ValueRange::below(0.45)),
            BiomeRule::new("rainforest")
                .temperature(ValueRange::above(0.65))
                .moisture(ValueRange::above(0.7)),
            BiomeRule::new("swamp")
                .moisture(ValueRange::above(0.8))
                .elevation(ValueRange::below(0.45)),
            BiomeRule::new("forest").moisture(ValueRange::above(0.5)),
            BiomeRule::new("grassland"),
        ];
        Self {
            biomes,
            rules,
            fallback: String::from("grassland"),
        }
    }
}

impl BiomeRuleTable {
    /// Validate the table and resolve every name to a [`BiomeId`].
    pub fn compile(&self) -> Result<BiomeTable, ConfigError> {
        if self.rules.is_empty() {
            return Err(ConfigError::EmptyRuleTable);
        }

        let mut registry = BiomeRegistry::new();
        for def in &self.biomes {
            if let Some(cost) = def.road_cost {
                if !cost.is_finite() || cost <= 0.0 {
                    return Err(ConfigError::invalid(
                        format!("biome_rules.biomes.{}.road_cost", def.name),
                        "must be finite and positive",
                    ));
                }
            }
            registry.register(def.clone())?;
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (index, rule) in self.rules.iter().enumerate() {
            for (label, range) in [
                ("elevation", rule.elevation),
                ("moisture", rule.moisture),
                ("temperature", rule.temperature),
            ] {
                if !range.is_valid() {
                    return Err(ConfigError::InvalidBiomeRule {
                        index,
                        biome: rule.biome.clone(),
                        reason: format!(
                            "{label} range [{}, {}) is inverted or not finite",
                            range.min, range.max
                        ),
                    });
                }
            }
            rules.push(CompiledRule {
                biome: registry.require(&rule.biome)?,
                elevation: rule.elevation,
                moisture: rule.moisture,
                temperature: rule.temperature,
            });
        }

        let fallback = registry.require(&self.fallback)?;
        Ok(BiomeTable {
            registry,
            rules,
            fallback,
        })
    }
}

#[derive(Clone, Debug)]
struct CompiledRule {
    biome: BiomeId,
    elevation: ValueRange,
    moisture: ValueRange,
    temperature: ValueRange,
}

/// A validated rule table with names resolved to ids.
#[derive(Clone, Debug)]
pub struct BiomeTable {
    registry: BiomeRegistry,
    rules: Vec<CompiledRule>,
    fallback: BiomeId,
}

impl BiomeTable {
    /// First matching rule wins; no match yields the fallback.
    pub fn classify(&self, elevation: f64, moisture: f64, temperature: f64) -> BiomeId {
        self.rules
            .iter()
            .find(|r| {
                r.elevation.contains(elevation)
                    && r.moisture.contains(moisture)
                    && r.temperature.contains(temperature)
            })
            .map_or(self.fallback, |r| r.biome)
    }

    pub fn registry(&self) -> &BiomeRegistry {
        &self.registry
    }

    pub fn def(&self, id: BiomeId) -> &BiomeDef {
        self.registry.get(id)
    }

    pub fn fallback(&self) -> BiomeId {
        self.fallback
    }

    /// Cheapest road cost among passable biomes.
    pub fn min_road_cost(&self) -> Option<f64> {
        self.registry
            .iter()
            .filter_map(|(_, def)| def.road_cost)
            .reduce(f64::min)
    }

    /// Most expensive road cost among passable biomes.
    pub fn max_road_cost(&self) -> Option<f64> {
        self.registry
            .iter()
            .filter_map(|(_, def)| def.road_cost)
            .reduce(f64::max)
    }
}
