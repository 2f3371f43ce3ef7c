//! Biome system: registry, ordered rule table, and climate-driven classification.
//!
//! Each cell is classified from its elevation plus independently seeded
//! moisture and temperature noise fields, evaluated against a
//! [`BiomeRuleTable`] in rule order.

mod classifier;
mod def;
mod registry;
mod rules;

pub use classifier::{BiomeClassifier, BiomeMap, ClimateConfig, ClimateGrid};
pub use def::BiomeDef;
pub use registry::{BiomeId, BiomeRegistry};
pub use rules::{BiomeRule, BiomeRuleTable, BiomeTable, ValueRange};
