//! Particle-based hydraulic erosion.
//!
//! Droplets are simulated in fixed-size batches. Every droplet of a batch
//! reads the same snapshot of the elevation field and records its own list of
//! `(cell, delta)` changes; the batch's changes are then applied in droplet
//! order. Each droplet draws from its own `(seed, Erosion, droplet index)`
//! stream, so the outcome does not depend on how rayon schedules the batch.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StageError};
use crate::seed::{StageTag, unit_rng};
use crate::stage::StageContext;

/// Hydraulic erosion parameters. Disabled by default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErosionConfig {
    pub enabled: bool,
    /// Total droplets simulated.
    pub droplets: u32,
    /// Droplets per snapshot batch.
    pub batch_size: u32,
    /// Maximum steps a droplet moves before it is discarded.
    pub max_lifetime: u32,
    /// How much of the previous direction a droplet keeps, `[0, 1)`.
    pub inertia: f64,
    /// Sediment capacity multiplier.
    pub capacity: f64,
    /// Floor on the slope term of the capacity formula.
    pub min_slope: f64,
    /// Fraction of free capacity eroded per step.
    pub erode_speed: f64,
    /// Fraction of excess sediment deposited per step.
    pub deposit_speed: f64,
    /// Fraction of water lost per step.
    pub evaporation: f64,
    /// Radius of the erosion brush in cells.
    pub radius: u32,
}

impl Default for ErosionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            droplets: 20_000,
            batch_size: 1_024,
            max_lifetime: 30,
            inertia: 0.05,
            capacity: 4.0,
            min_slope: 0.01,
            erode_speed: 0.3,
            deposit_speed: 0.3,
            evaporation: 0.02,
            radius: 2,
        }
    }
}

impl ErosionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid(
                "heightmap.erosion.batch_size",
                "must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.inertia) {
            return Err(ConfigError::invalid(
                "heightmap.erosion.inertia",
                "must be in [0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.evaporation) {
            return Err(ConfigError::invalid(
                "heightmap.erosion.evaporation",
                "must be in [0, 1)",
            ));
        }
        Ok(())
    }
}

/// Totals gathered over an erosion run.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ErosionStats {
    pub eroded: f64,
    pub deposited: f64,
}

/// Brush weights for distributing erosion over nearby cells.
fn erosion_brush(radius: u32) -> Vec<(i32, i32, f64)> {
    let r = radius as i32;
    let mut brush = Vec::new();
    let mut total = 0.0;
    for dy in -r..=r {
        for dx in -r..=r {
            let dist = ((dx * dx + dy * dy) as f64).sqrt();
            if dist <= radius as f64 {
                let weight = 1.0 - dist / (radius as f64 + 1.0);
                brush.push((dx, dy, weight));
                total += weight;
            }
        }
    }
    for entry in &mut brush {
        entry.2 /= total;
    }
    brush
}

struct Snapshot<'a> {
    heights: &'a [f64],
    width: usize,
    height: usize,
}

impl Snapshot<'_> {
    /// Bilinear height and gradient at a fractional position.
    fn sample(&self, x: f64, y: f64) -> (f64, f64, f64) {
        let cx = (x.floor() as usize).min(self.width - 2);
        let cy = (y.floor() as usize).min(self.height - 2);
        let fx = x - cx as f64;
        let fy = y - cy as f64;
        let i = cy * self.width + cx;
        let h00 = self.heights[i];
        let h10 = self.heights[i + 1];
        let h01 = self.heights[i + self.width];
        let h11 = self.heights[i + self.width + 1];
        let gx = (h10 - h00) * (1.0 - fy) + (h11 - h01) * fy;
        let gy = (h01 - h00) * (1.0 - fx) + (h11 - h10) * fx;
        let h = h00 * (1.0 - fx) * (1.0 - fy) + h10 * fx * (1.0 - fy) + h01 * (1.0 - fx) * fy
            + h11 * fx * fy;
        (h, gx, gy)
    }

    fn in_bounds(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x < (self.width - 1) as f64 && y < (self.height - 1) as f64
    }
}

/// Erode `heights` (row-major, `width × height`) in place.
pub fn erode(
    heights: &mut [f64],
    width: usize,
    height: usize,
    config: &ErosionConfig,
    world_seed: u64,
    ctx: &StageContext,
) -> Result<ErosionStats, StageError> {
    let mut stats = ErosionStats::default();
    if !config.enabled || width < 3 || height < 3 || config.droplets == 0 {
        return Ok(stats);
    }

    let brush = erosion_brush(config.radius);
    let batch_size = config.batch_size.max(1);
    let batches = config.droplets.div_ceil(batch_size);

    for batch in 0..batches {
        ctx.check()?;
        let start = batch * batch_size;
        let end = (start + batch_size).min(config.droplets);
        let snapshot = Snapshot {
            heights: &*heights,
            width,
            height,
        };

        let changes: Vec<Vec<(usize, f64)>> = (start..end)
            .into_par_iter()
            .map(|droplet| simulate_droplet(&snapshot, &brush, config, world_seed, droplet))
            .collect();

        for droplet_changes in changes {
            for (index, delta) in droplet_changes {
                if delta < 0.0 {
                    stats.eroded -= delta;
                } else {
                    stats.deposited += delta;
                }
                heights[index] = (heights[index] + delta).clamp(0.0, 1.0);
            }
        }
        ctx.report_every(batch as usize + 1, batches as usize, 4);
    }

    tracing::debug!(
        eroded = stats.eroded,
        deposited = stats.deposited,
        droplets = config.droplets,
        "Hydraulic erosion finished"
    );
    Ok(stats)
}

fn simulate_droplet(
    map: &Snapshot<'_>,
    brush: &[(i32, i32, f64)],
    config: &ErosionConfig,
    world_seed: u64,
    droplet: u32,
) -> Vec<(usize, f64)> {
    let mut rng = unit_rng(world_seed, StageTag::Erosion, droplet as u64);
    let mut changes = Vec::new();

    let mut x = rng.random_range(0.0..(map.width - 1) as f64);
    let mut y = rng.random_range(0.0..(map.height - 1) as f64);
    let (mut dir_x, mut dir_y) = (0.0f64, 0.0f64);
    let mut speed = 1.0f64;
    let mut water = 1.0f64;
    let mut sediment = 0.0f64;

    for _ in 0..config.max_lifetime {
        let (h, gx, gy) = map.sample(x, y);
        let cell = (y.floor() as usize) * map.width + x.floor() as usize;

        dir_x = dir_x * config.inertia - gx * (1.0 - config.inertia);
        dir_y = dir_y * config.inertia - gy * (1.0 - config.inertia);
        let len = (dir_x * dir_x + dir_y * dir_y).sqrt();
        if len < 1e-9 {
            break;
        }
        dir_x /= len;
        dir_y /= len;

        let (nx, ny) = (x + dir_x, y + dir_y);
        if !map.in_bounds(nx, ny) {
            break;
        }
        let (new_h, _, _) = map.sample(nx, ny);
        let delta_h = new_h - h;

        let capacity = (-delta_h).max(config.min_slope) * speed * water * config.capacity * 0.01;
        if sediment > capacity || delta_h > 0.0 {
            let amount = if delta_h > 0.0 {
                delta_h.min(sediment)
            } else {
                (sediment - capacity) * config.deposit_speed
            };
            sediment -= amount;
            changes.push((cell, amount));
        } else {
            let amount = ((capacity - sediment) * config.erode_speed).min(-delta_h);
            let cx = x.floor() as i32;
            let cy = y.floor() as i32;
            for &(dx, dy, weight) in brush {
                let bx = cx + dx;
                let by = cy + dy;
                if bx >= 0 && by >= 0 && (bx as usize) < map.width && (by as usize) < map.height {
                    changes.push((by as usize * map.width + bx as usize, -amount * weight));
                }
            }
            sediment += amount;
        }

        speed = (speed * speed + delta_h.abs()).sqrt();
        water *= 1.0 - config.evaporation;
        x = nx;
        y = ny;
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slope(width: usize, height: usize) -> Vec<f64> {
        (0..width * height)
            .map(|i| 0.9 - 0.8 * (i % width) as f64 / width as f64)
            .collect()
    }

    #[test]
    fn test_disabled_is_a_no_op() {
        let mut heights = slope(32, 32);
        let before = heights.clone();
        let stats = erode(
            &mut heights,
            32,
            32,
            &ErosionConfig::default(),
            1,
            &StageContext::detached(),
        )
        .unwrap();
        assert_eq!(heights, before);
        assert_eq!(stats, ErosionStats::default());
    }

    #[test]
    fn test_erosion_changes_slope_and_stays_in_range() {
        let mut heights = slope(48, 48);
        let before = heights.clone();
        let config = ErosionConfig {
            enabled: true,
            droplets: 2_000,
            batch_size: 256,
            ..Default::default()
        };
        let stats = erode(&mut heights, 48, 48, &config, 9, &StageContext::detached()).unwrap();
        assert!(stats.eroded > 0.0, "Droplets on a slope should erode");
        assert_ne!(heights, before);
        assert!(heights.iter().all(|h| (0.0..=1.0).contains(h)));
    }

    #[test]
    fn test_erosion_is_deterministic() {
        let config = ErosionConfig {
            enabled: true,
            droplets: 1_000,
            batch_size: 100,
            ..Default::default()
        };
        let mut a = slope(40, 40);
        let mut b = slope(40, 40);
        erode(&mut a, 40, 40, &config, 77, &StageContext::detached()).unwrap();
        erode(&mut b, 40, 40, &config, 77, &StageContext::detached()).unwrap();
        assert_eq!(a, b, "Batched parallel erosion must be reproducible");
    }

    #[test]
    fn test_brush_weights_sum_to_one() {
        let total: f64 = erosion_brush(3).iter().map(|b| b.2).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
