//! Elevation grid synthesis.
//!
//! Samples the elevation [`NoiseField`] once per cell (rows are spread over
//! the rayon pool), maps the result to `[0, 1]`, shapes it with a
//! [`RemapCurve`], and blends a band along the map edge toward a fixed base
//! elevation so neighbouring regions meet without seams.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::erosion::{self, ErosionConfig};
use crate::error::{ConfigError, StageError};
use crate::grid::{Extent, Grid, GridPos, neighbor_distance, try_alloc};
use crate::noise_field::{NoiseField, OctaveConfig};
use crate::seed::{StageTag, det_pow};
use crate::stage::StageContext;

/// Shapes normalized noise before falloff.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RemapCurve {
    Linear,
    /// `v^exponent`; exponents above 1 widen lowlands and sharpen peaks.
    Power { exponent: f64 },
    /// Quantize into `steps` flat terraces.
    Terrace { steps: u32 },
    /// Flatten the middle of the range toward 0.5 by `flatness` in `[0, 1]`.
    Plains { flatness: f64 },
}

impl Default for RemapCurve {
    fn default() -> Self {
        Self::Power { exponent: 1.3 }
    }
}

impl RemapCurve {
    /// Map `v` in `[0, 1]` to `[0, 1]`.
    pub fn apply(&self, v: f64) -> f64 {
        let v = v.clamp(0.0, 1.0);
        let out = match *self {
            Self::Linear => v,
            Self::Power { exponent } => det_pow(v, exponent),
            Self::Terrace { steps } => {
                if steps == 0 {
                    v
                } else {
                    let s = steps as f64;
                    ((v * s).floor() / s).min(1.0)
                }
            }
            Self::Plains { flatness } => {
                let centered = v - 0.5;
                let shaped = centered * centered.abs() * 2.0;
                0.5 + centered * (1.0 - flatness) + shaped * flatness
            }
        };
        out.clamp(0.0, 1.0)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Power { exponent } if !exponent.is_finite() || exponent <= 0.0 => Err(
                ConfigError::invalid("heightmap.remap", "power exponent must be positive"),
            ),
            Self::Plains { flatness } if !(0.0..=1.0).contains(&flatness) => Err(
                ConfigError::invalid("heightmap.remap", "plains flatness must be in [0, 1]"),
            ),
            _ => Ok(()),
        }
    }
}

/// Heightmap shaping parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeightmapConfig {
    pub remap: RemapCurve,
    /// Width in cells of the edge band blended toward `base_elevation`.
    pub falloff_width: u32,
    /// Elevation every region edge converges to.
    pub base_elevation: f64,
    /// World units spanned by the full `[0, 1]` elevation range.
    pub vertical_scale: f64,
    pub erosion: ErosionConfig,
}

impl Default for HeightmapConfig {
    fn default() -> Self {
        Self {
            remap: RemapCurve::default(),
            falloff_width: 16,
            base_elevation: 0.35,
            vertical_scale: 400.0,
            erosion: ErosionConfig::default(),
        }
    }
}

impl HeightmapConfig {
    pub fn validate(&self, extent: Extent) -> Result<(), ConfigError> {
        self.remap.validate()?;
        if !(0.0..=1.0).contains(&self.base_elevation) {
            return Err(ConfigError::invalid(
                "heightmap.base_elevation",
                "must be in [0, 1]",
            ));
        }
        if !self.vertical_scale.is_finite() || self.vertical_scale <= 0.0 {
            return Err(ConfigError::invalid(
                "heightmap.vertical_scale",
                "must be finite and positive",
            ));
        }
        if self.falloff_width > extent.width.min(extent.height) / 2 {
            return Err(ConfigError::invalid(
                "heightmap.falloff_width",
                format!(
                    "{} exceeds half the smaller map dimension ({}x{})",
                    self.falloff_width, extent.width, extent.height
                ),
            ));
        }
        self.erosion.validate()
    }
}

/// Committed elevation grid.
///
/// Elevations are normalized to `[0, 1]`; `vertical_scale` converts them to
/// world units and `cell_size` gives the horizontal spacing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeightmapGrid {
    elevations: Grid<f64>,
    origin: (i64, i64),
    cell_size: f64,
    vertical_scale: f64,
}

impl HeightmapGrid {
    /// Wrap precomputed elevations. Returns `None` on a length mismatch.
    pub fn from_elevations(
        extent: Extent,
        elevations: Vec<f64>,
        cell_size: f64,
        vertical_scale: f64,
    ) -> Option<Self> {
        Some(Self {
            elevations: Grid::from_vec(extent, elevations)?,
            origin: (0, 0),
            cell_size,
            vertical_scale,
        })
    }

    pub fn extent(&self) -> Extent {
        self.elevations.extent()
    }

    /// World-space origin of cell (0, 0), in cells.
    pub fn origin(&self) -> (i64, i64) {
        self.origin
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn vertical_scale(&self) -> f64 {
        self.vertical_scale
    }

    #[inline]
    pub fn elevation(&self, pos: GridPos) -> f64 {
        *self.elevations.get(pos)
    }

    #[inline]
    pub fn elevation_at_index(&self, index: usize) -> f64 {
        *self.elevations.get_index(index)
    }

    pub fn elevations(&self) -> &[f64] {
        self.elevations.as_slice()
    }

    pub fn grid(&self) -> &Grid<f64> {
        &self.elevations
    }

    /// Surface altitude in world units at a cell.
    pub fn altitude(&self, pos: GridPos) -> f64 {
        self.elevation(pos) * self.vertical_scale
    }

    /// Bilinearly interpolated surface altitude at a fractional cell position.
    pub fn altitude_at(&self, x: f64, y: f64) -> f64 {
        let extent = self.extent();
        let max_x = (extent.width - 1) as f64;
        let max_y = (extent.height - 1) as f64;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(extent.width - 1);
        let y1 = (y0 + 1).min(extent.height - 1);
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;
        let h = |px, py| self.elevation(GridPos::new(px, py));
        let top = h(x0, y0) * (1.0 - fx) + h(x1, y0) * fx;
        let bottom = h(x0, y1) * (1.0 - fx) + h(x1, y1) * fx;
        (top * (1.0 - fy) + bottom * fy) * self.vertical_scale
    }

    /// Steepest slope from `pos` to any neighbour, in degrees.
    pub fn slope_degrees(&self, pos: GridPos) -> f64 {
        let extent = self.extent();
        let h = self.altitude(pos);
        let mut steepest = 0.0f64;
        for (dir, n) in extent.neighbors(pos) {
            let rise = (self.altitude(n) - h).abs();
            let run = neighbor_distance(dir) * self.cell_size;
            steepest = steepest.max(rise / run);
        }
        steepest.atan().to_degrees()
    }

    /// Min and max elevation.
    pub fn range(&self) -> (f64, f64) {
        self.elevations()
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), &h| (lo.min(h), hi.max(h)))
    }
}

fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Builds a [`HeightmapGrid`] from the elevation noise field.
pub struct HeightmapBuilder {
    seed: u64,
    extent: Extent,
    origin: (i64, i64),
    cell_size: f64,
    field: NoiseField,
    config: HeightmapConfig,
}

impl HeightmapBuilder {
    pub fn new(
        seed: u64,
        extent: Extent,
        origin: (i64, i64),
        cell_size: f64,
        noise: OctaveConfig,
        config: HeightmapConfig,
    ) -> Result<Self, ConfigError> {
        if extent.width == 0 || extent.height == 0 {
            return Err(ConfigError::NonPositiveExtent {
                width: extent.width,
                height: extent.height,
            });
        }
        noise.validate("elevation")?;
        config.validate(extent)?;
        Ok(Self {
            seed,
            extent,
            origin,
            cell_size,
            field: NoiseField::for_stage(seed, StageTag::Elevation, noise),
            config,
        })
    }

    /// Remapped elevation before edge falloff, from world cell coordinates.
    pub fn raw_elevation(&self, world_x: f64, world_y: f64) -> f64 {
        self.config.remap.apply(self.field.sample01(world_x, world_y))
    }

    /// Weight of the noise-derived elevation at `pos`; 0 on the edge, 1 inland.
    pub fn falloff_weight(&self, pos: GridPos) -> f64 {
        if self.config.falloff_width == 0 {
            return 1.0;
        }
        let d = self.extent.edge_distance(pos) as f64;
        smoothstep(d / self.config.falloff_width as f64)
    }

    fn blend(&self, pos: GridPos, value: f64) -> f64 {
        let t = self.falloff_weight(pos);
        if t >= 1.0 {
            value
        } else {
            self.config.base_elevation * (1.0 - t) + value * t
        }
    }

    /// Sample, shape, erode and commit the grid.
    pub fn build(&self, ctx: &StageContext) -> Result<HeightmapGrid, StageError> {
        let width = self.extent.width as usize;
        let height = self.extent.height as usize;
        let mut cells = try_alloc(self.extent.cell_count(), 0.0f64, "heightmap")?;

        let rows_done = AtomicUsize::new(0);
        cells
            .par_chunks_mut(width)
            .enumerate()
            .try_for_each(|(y, row)| -> Result<(), StageError> {
                ctx.check()?;
                let wy = (self.origin.1 + y as i64) as f64;
                for (x, cell) in row.iter_mut().enumerate() {
                    let wx = (self.origin.0 + x as i64) as f64;
                    let pos = GridPos::new(x as u32, y as u32);
                    *cell = self.blend(pos, self.raw_elevation(wx, wy));
                }
                let done = rows_done.fetch_add(1, Ordering::Relaxed) + 1;
                ctx.report_every(done, height, 16);
                Ok(())
            })?;

        if self.config.erosion.enabled {
            erosion::erode(
                &mut cells,
                width,
                height,
                &self.config.erosion,
                self.seed,
                ctx,
            )?;
            // Re-pin the edge band so region seams still meet at base elevation.
            for (i, cell) in cells.iter_mut().enumerate() {
                let pos = self.extent.pos(i);
                if self.falloff_weight(pos) < 1.0 {
                    *cell = self.blend(pos, *cell);
                }
            }
        }

        let elevations = Grid::from_vec(self.extent, cells)
            .ok_or_else(|| StageError::Failed("heightmap size mismatch".into()))?;
        let grid = HeightmapGrid {
            elevations,
            origin: self.origin,
            cell_size: self.cell_size,
            vertical_scale: self.config.vertical_scale,
        };
        let (lo, hi) = grid.range();
        tracing::debug!(
            width,
            height,
            min = lo,
            max = hi,
            "Heightmap committed"
        );
        Ok(grid)
    }
}
