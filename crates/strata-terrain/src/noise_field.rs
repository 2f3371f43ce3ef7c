//! Multi-octave coherent noise fields.
//!
//! Composites several octaves of simplex noise and normalizes by the sum of
//! octave amplitudes, so every field lands in `[-1, 1]` regardless of octave
//! count or persistence.

use noise::{NoiseFn, Simplex};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::seed::{StageTag, derive_stage_seed, noise_seed};

/// How individual octaves are shaped before they are summed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum NoiseKind {
    /// Plain fractal Brownian motion.
    #[default]
    Fbm,
    /// Absolute-valued octaves; puffy, rounded hills.
    Billow,
    /// Inverted absolute-valued octaves; sharp crests.
    Ridged,
    /// fBm sampled at coordinates displaced by two auxiliary fields.
    /// `strength` is the maximum displacement in cells.
    DomainWarped { strength: f64 },
    /// Cellular octaves: distance to the nearest jittered feature point, one
    /// point per cell of side `1 / frequency`. `invert` turns the cell floors
    /// into plateaus.
    Worley { invert: bool },
}

/// Octave parameters of one noise field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OctaveConfig {
    /// Number of octaves composited. Must be at least 1.
    pub octaves: u32,
    /// Amplitude multiplier between successive octaves, in `(0, 1]`.
    pub persistence: f64,
    /// Frequency multiplier between successive octaves.
    pub lacunarity: f64,
    /// Frequency of the first octave, in cycles per cell.
    pub base_frequency: f64,
    /// Octave shaping.
    pub kind: NoiseKind,
}

impl Default for OctaveConfig {
    fn default() -> Self {
        Self {
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            base_frequency: 0.01,
            kind: NoiseKind::Fbm,
        }
    }
}

impl OctaveConfig {
    /// Reject configurations that would make sampling meaningless.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.octaves == 0 {
            return Err(ConfigError::ZeroOctaves {
                field: field.to_string(),
            });
        }
        if !(self.persistence > 0.0 && self.persistence <= 1.0) {
            return Err(ConfigError::invalid(
                format!("{field}.persistence"),
                format!("must be in (0, 1], got {}", self.persistence),
            ));
        }
        if !self.lacunarity.is_finite() || self.lacunarity <= 0.0 {
            return Err(ConfigError::invalid(
                format!("{field}.lacunarity"),
                format!("must be finite and positive, got {}", self.lacunarity),
            ));
        }
        if !self.base_frequency.is_finite() || self.base_frequency <= 0.0 {
            return Err(ConfigError::invalid(
                format!("{field}.base_frequency"),
                format!("must be finite and positive, got {}", self.base_frequency),
            ));
        }
        if let NoiseKind::DomainWarped { strength } = self.kind {
            if !strength.is_finite() || strength < 0.0 {
                return Err(ConfigError::invalid(
                    format!("{field}.kind"),
                    "domain warp strength must be finite and non-negative",
                ));
            }
        }
        Ok(())
    }

    /// Sum of all octave amplitudes (first octave has amplitude 1).
    pub fn amplitude_sum(&self) -> f64 {
        let mut sum = 0.0;
        let mut amplitude = 1.0;
        for _ in 0..self.octaves {
            sum += amplitude;
            amplitude *= self.persistence;
        }
        sum
    }
}

/// A seeded noise field.
///
/// Holds only immutable permutation tables, so one instance is shared across
/// every worker of a stage.
pub struct NoiseField {
    noise: Simplex,
    warp_x: Simplex,
    warp_y: Simplex,
    cell_seed: u32,
    config: OctaveConfig,
}

impl NoiseField {
    /// Build a field from an already-derived 64-bit seed.
    pub fn new(seed: u64, config: OctaveConfig) -> Self {
        let warp_seed = seed.rotate_left(17) ^ 0x9E37_79B9_7F4A_7C15;
        Self {
            noise: Simplex::new(noise_seed(seed)),
            warp_x: Simplex::new(noise_seed(warp_seed)),
            warp_y: Simplex::new(noise_seed(warp_seed.rotate_left(29))),
            cell_seed: noise_seed(seed.rotate_right(23)),
            config,
        }
    }

    /// Build the field for one stage tag of a world.
    pub fn for_stage(world_seed: u64, tag: StageTag, config: OctaveConfig) -> Self {
        Self::new(derive_stage_seed(world_seed, tag), config)
    }

    pub fn config(&self) -> &OctaveConfig {
        &self.config
    }

    /// Sample with this field's own configuration. Output is in `[-1, 1]`.
    pub fn sample(&self, x: f64, y: f64) -> f64 {
        self.sample_with(x, y, &self.config)
    }

    /// Sample with an explicit configuration. Output is in `[-1, 1]`.
    pub fn sample_with(&self, x: f64, y: f64, config: &OctaveConfig) -> f64 {
        let value = match config.kind {
            NoiseKind::Fbm => self.octave_sum(x, y, config, |p| self.noise.get(p)),
            NoiseKind::Billow => {
                self.octave_sum(x, y, config, |p| self.noise.get(p).abs()) * 2.0 - 1.0
            }
            NoiseKind::Ridged => {
                self.octave_sum(x, y, config, |p| 1.0 - self.noise.get(p).abs()) * 2.0 - 1.0
            }
            NoiseKind::DomainWarped { strength } => {
                let f = config.base_frequency * 0.5;
                let dx = self.warp_x.get([x * f, y * f]) * strength;
                let dy = self.warp_y.get([x * f, y * f]) * strength;
                self.octave_sum(x + dx, y + dy, config, |p| self.noise.get(p))
            }
            NoiseKind::Worley { invert } => self.octave_sum(x, y, config, |p| {
                let v = self.cellular(p) * 2.0 - 1.0;
                if invert { -v } else { v }
            }),
        };
        value.clamp(-1.0, 1.0)
    }

    /// Sample remapped to `[0, 1]`.
    pub fn sample01(&self, x: f64, y: f64) -> f64 {
        (self.sample(x, y) + 1.0) * 0.5
    }

    fn octave_sum(&self, x: f64, y: f64, config: &OctaveConfig, basis: impl Fn([f64; 2]) -> f64) -> f64 {
        let mut total = 0.0;
        let mut frequency = config.base_frequency;
        let mut amplitude = 1.0;
        for _ in 0..config.octaves {
            total += basis([x * frequency, y * frequency]) * amplitude;
            frequency *= config.lacunarity;
            amplitude *= config.persistence;
        }
        let norm = config.amplitude_sum();
        if norm > 0.0 { total / norm } else { 0.0 }
    }

    /// F1 distance to the feature points of the 3×3 surrounding cells, scaled
    /// by the cell diagonal into `[0, 1]`.
    fn cellular(&self, [x, y]: [f64; 2]) -> f64 {
        let (ix, iy) = (x.floor(), y.floor());
        let (fx, fy) = (x - ix, y - iy);
        let mut min_d2 = f64::INFINITY;
        for dy in -1..=1i64 {
            for dx in -1..=1i64 {
                let cx = ix as i64 + dx;
                let cy = iy as i64 + dy;
                let jx = cell_jitter(self.cell_seed, cx, cy, 0x068b_c021);
                let jy = cell_jitter(self.cell_seed, cx, cy, 0x02e1_b213);
                let ox = dx as f64 + jx - fx;
                let oy = dy as f64 + jy - fy;
                min_d2 = min_d2.min(ox * ox + oy * oy);
            }
        }
        (min_d2.sqrt() / std::f64::consts::SQRT_2).min(1.0)
    }
}

/// Feature-point offset in `[0, 1)` for one cell.
fn cell_jitter(seed: u32, cx: i64, cy: i64, salt: u32) -> f64 {
    fn mix(mut v: u32) -> u32 {
        v ^= v >> 16;
        v = v.wrapping_mul(0x7feb_352d);
        v ^= v >> 15;
        v = v.wrapping_mul(0x846c_a68b);
        v ^= v >> 16;
        v
    }
    let mut h = seed ^ salt ^ 0x9e37_79b9;
    h ^= mix((cx as u32).wrapping_add(0x85eb_ca6b));
    h ^= mix((cy as u32).wrapping_add(0xc2b2_ae35));
    (mix(h) & 0x00ff_ffff) as f64 / 16_777_216.0
}
