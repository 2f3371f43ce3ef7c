//! Biome registry: maps [`BiomeId`] to [`BiomeDef`] with name-based lookup.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use super::BiomeDef;
use crate::error::ConfigError;

/// Unique identifier for a biome; index into the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BiomeId(pub u16);

/// Stores all registered biome definitions with O(1) lookup by ID.
#[derive(Clone, Debug, Default)]
pub struct BiomeRegistry {
    biomes: Vec<BiomeDef>,
    name_to_id: HashMap<String, BiomeId>,
}

impl BiomeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new biome definition, returning its assigned [`BiomeId`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateBiome`] if a biome with the same name exists.
    pub fn register(&mut self, def: BiomeDef) -> Result<BiomeId, ConfigError> {
        if self.name_to_id.contains_key(&def.name) {
            return Err(ConfigError::DuplicateBiome(def.name));
        }
        let id = BiomeId(self.biomes.len() as u16);
        self.name_to_id.insert(def.name.clone(), id);
        self.biomes.push(def);
        Ok(id)
    }

    /// Returns the definition for the given biome ID.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn get(&self, id: BiomeId) -> &BiomeDef {
        &self.biomes[id.0 as usize]
    }

    /// Looks up a biome ID by name.
    pub fn lookup_by_name(&self, name: &str) -> Option<BiomeId> {
        self.name_to_id.get(name).copied()
    }

    /// Looks up a biome ID by name, failing with [`ConfigError::UnknownBiome`].
    pub fn require(&self, name: &str) -> Result<BiomeId, ConfigError> {
        self.lookup_by_name(name)
            .ok_or_else(|| ConfigError::UnknownBiome(name.to_string()))
    }

    /// Iterate `(id, def)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (BiomeId, &BiomeDef)> {
        self.biomes
            .iter()
            .enumerate()
            .map(|(i, def)| (BiomeId(i as u16), def))
    }

    /// Returns the number of registered biomes.
    pub fn len(&self) -> usize {
        self.biomes.len()
    }

    /// Returns `true` if no biomes are registered.
    pub fn is_empty(&self) -> bool {
        self.biomes.is_empty()
    }
}
