//! Biome classifier: samples moisture and temperature fields and applies the
//! rule table to every cell of a committed heightmap.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{BiomeId, BiomeTable};
use crate::error::{ConfigError, StageError};
use crate::grid::{Extent, Grid, GridPos, try_alloc};
use crate::heightmap::HeightmapGrid;
use crate::noise_field::{NoiseField, OctaveConfig};
use crate::seed::StageTag;
use crate::stage::StageContext;

/// Moisture and temperature field parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClimateConfig {
    pub moisture: OctaveConfig,
    pub temperature: OctaveConfig,
    /// Temperature drop per unit of elevation above the base elevation.
    pub lapse_rate: f64,
    /// Elevation at which the lapse rate starts to apply.
    pub lapse_base: f64,
}

impl Default for ClimateConfig {
    fn default() -> Self {
        let broad = OctaveConfig {
            octaves: 3,
            base_frequency: 0.004,
            ..Default::default()
        };
        Self {
            moisture: broad.clone(),
            temperature: broad,
            lapse_rate: 0.4,
            lapse_base: 0.35,
        }
    }
}

impl ClimateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.moisture.validate("climate.moisture")?;
        self.temperature.validate("climate.temperature")?;
        if !self.lapse_rate.is_finite() || self.lapse_rate < 0.0 {
            return Err(ConfigError::invalid(
                "climate.lapse_rate",
                "must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

/// Per-cell moisture and temperature, both in `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClimateGrid {
    moisture: Grid<f64>,
    temperature: Grid<f64>,
}

impl ClimateGrid {
    pub fn moisture(&self, pos: GridPos) -> f64 {
        *self.moisture.get(pos)
    }

    pub fn temperature(&self, pos: GridPos) -> f64 {
        *self.temperature.get(pos)
    }

    pub fn moisture_grid(&self) -> &Grid<f64> {
        &self.moisture
    }

    pub fn temperature_grid(&self) -> &Grid<f64> {
        &self.temperature
    }
}

/// One [`BiomeId`] per cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BiomeMap {
    ids: Grid<BiomeId>,
}

impl BiomeMap {
    /// Map with every cell set to `id`.
    pub fn uniform(extent: Extent, id: BiomeId) -> Result<Self, StageError> {
        Ok(Self {
            ids: Grid::filled(extent, id)?,
        })
    }

    /// Wrap precomputed ids. Returns `None` on a length mismatch.
    pub fn from_ids(extent: Extent, ids: Vec<BiomeId>) -> Option<Self> {
        Some(Self {
            ids: Grid::from_vec(extent, ids)?,
        })
    }

    #[inline]
    pub fn biome(&self, pos: GridPos) -> BiomeId {
        *self.ids.get(pos)
    }

    #[inline]
    pub fn biome_at_index(&self, index: usize) -> BiomeId {
        *self.ids.get_index(index)
    }

    pub fn extent(&self) -> Extent {
        self.ids.extent()
    }

    pub fn grid(&self) -> &Grid<BiomeId> {
        &self.ids
    }

    /// Cell count per biome id, indexed by `BiomeId.0`.
    pub fn histogram(&self, biome_count: usize) -> Vec<usize> {
        let mut counts = vec![0usize; biome_count];
        for id in self.ids.as_slice() {
            if let Some(c) = counts.get_mut(id.0 as usize) {
                *c += 1;
            }
        }
        counts
    }
}

/// Classifies every cell of a heightmap into a biome.
pub struct BiomeClassifier {
    moisture: NoiseField,
    temperature: NoiseField,
    lapse_rate: f64,
    lapse_base: f64,
    table: Arc<BiomeTable>,
}

impl BiomeClassifier {
    /// Moisture and temperature fields are seeded independently of elevation
    /// and of each other.
    pub fn new(seed: u64, config: &ClimateConfig, table: Arc<BiomeTable>) -> Self {
        Self {
            moisture: NoiseField::for_stage(seed, StageTag::Moisture, config.moisture.clone()),
            temperature: NoiseField::for_stage(
                seed,
                StageTag::Temperature,
                config.temperature.clone(),
            ),
            lapse_rate: config.lapse_rate,
            lapse_base: config.lapse_base,
            table,
        }
    }

    /// Moisture and temperature at a world cell coordinate with the given elevation.
    pub fn climate_at(&self, world_x: f64, world_y: f64, elevation: f64) -> (f64, f64) {
        let moisture = self.moisture.sample01(world_x, world_y);
        let cooling = self.lapse_rate * (elevation - self.lapse_base).max(0.0);
        let temperature = (self.temperature.sample01(world_x, world_y) - cooling).clamp(0.0, 1.0);
        (moisture, temperature)
    }

    pub fn classify(
        &self,
        heightmap: &HeightmapGrid,
        ctx: &StageContext,
    ) -> Result<(ClimateGrid, BiomeMap), StageError> {
        let extent = heightmap.extent();
        let width = extent.width as usize;
        let height = extent.height as usize;
        let (ox, oy) = heightmap.origin();

        let mut moisture = try_alloc(extent.cell_count(), 0.0f64, "moisture grid")?;
        let mut temperature = try_alloc(extent.cell_count(), 0.0f64, "temperature grid")?;
        let mut ids = try_alloc(extent.cell_count(), BiomeId::default(), "biome map")?;

        let rows_done = AtomicUsize::new(0);
        moisture
            .par_chunks_mut(width)
            .zip(temperature.par_chunks_mut(width))
            .zip(ids.par_chunks_mut(width))
            .enumerate()
            .try_for_each(|(y, ((m_row, t_row), id_row))| -> Result<(), StageError> {
                ctx.check()?;
                let wy = (oy + y as i64) as f64;
                for x in 0..width {
                    let wx = (ox + x as i64) as f64;
                    let elevation = heightmap.elevation(GridPos::new(x as u32, y as u32));
                    let (m, t) = self.climate_at(wx, wy, elevation);
                    m_row[x] = m;
                    t_row[x] = t;
                    id_row[x] = self.table.classify(elevation, m, t);
                }
                let done = rows_done.fetch_add(1, Ordering::Relaxed) + 1;
                ctx.report_every(done, height, 16);
                Ok(())
            })?;

        let mismatch = || StageError::Failed("climate grid size mismatch".into());
        let climate = ClimateGrid {
            moisture: Grid::from_vec(extent, moisture).ok_or_else(mismatch)?,
            temperature: Grid::from_vec(extent, temperature).ok_or_else(mismatch)?,
        };
        let biomes = BiomeMap::from_ids(extent, ids).ok_or_else(mismatch)?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let histogram = biomes.histogram(self.table.registry().len());
            for (id, def) in self.table.registry().iter() {
                tracing::debug!(biome = %def.name, cells = histogram[id.0 as usize], "Biome coverage");
            }
        }
        Ok((climate, biomes))
    }
}
