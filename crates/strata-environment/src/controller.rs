//! The season × weather × time-of-day state machine.

use glam::Vec3;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strata_terrain::StageTag;
use strata_terrain::seed::unit_rng;
use tracing::{debug, info};

use crate::config::{EnvironmentConfig, Season, Weather, WeatherOption};
use crate::error::EnvironmentError;
use crate::sun;

/// Coarse segment of the day derived from the clock hour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DayPhase {
    Night,
    Dawn,
    Morning,
    Noon,
    Afternoon,
    Dusk,
}

/// Snapshot of the live environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub season: Season,
    pub weather: Weather,
    /// Fraction of the current day in `[0, 1)`; 0 is midnight.
    pub time_of_day: f64,
    pub day_index: u64,
    pub phase: DayPhase,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnvironmentEvent {
    PhaseChanged { from: DayPhase, to: DayPhase, day: u64 },
    DayStarted { day: u64 },
    SeasonChanged { from: Season, to: Season },
    WeatherChanged {
        from: Weather,
        to: Weather,
        duration_hours: f64,
    },
}

/// Phase start hours in ascending order with the phase that begins there.
fn phase_schedule(sunrise: f64, sunset: f64) -> [(f64, DayPhase); 6] {
    let noon = (sunrise + sunset) / 2.0;
    [
        (sunrise - 1.0, DayPhase::Dawn),
        (sunrise + 1.0, DayPhase::Morning),
        (noon - 1.0, DayPhase::Noon),
        (noon + 1.0, DayPhase::Afternoon),
        (sunset - 1.0, DayPhase::Dusk),
        (sunset + 1.0, DayPhase::Night),
    ]
}

/// Advances game time and drives season and weather transitions.
///
/// Weather draws are numbered from zero; draw `n` uses the
/// `(seed, Environment, n)` substream, so two controllers built from the
/// same seed and config emit identical event sequences for identical
/// `advance` calls.
pub struct EnvironmentCycleController {
    config: EnvironmentConfig,
    seed: u64,
    schedule: [(f64, DayPhase); 6],
    /// Game hours since the start of day zero.
    now: f64,
    day_index: u64,
    season_index: usize,
    day_of_season: u32,
    phase: DayPhase,
    weather: Weather,
    weather_until: f64,
    weather_draws: u64,
    biome: Option<String>,
    paused: bool,
}

impl EnvironmentCycleController {
    pub fn new(seed: u64, config: EnvironmentConfig) -> Result<Self, EnvironmentError> {
        config.validate()?;
        let schedule = phase_schedule(config.sunrise_hour, config.sunset_hour);
        let hour = config.start_hour;
        let mut controller = Self {
            seed,
            schedule,
            now: hour,
            day_index: 0,
            season_index: 0,
            day_of_season: 0,
            phase: phase_at(&schedule, hour),
            weather: Weather::default(),
            weather_until: 0.0,
            weather_draws: 0,
            biome: None,
            paused: false,
            config,
        };
        let (weather, duration) = controller.draw_weather();
        controller.weather = weather;
        controller.weather_until = hour + duration;
        info!(
            "Environment cycle started: {:?}, {:?} for {duration:.1}h, hour {hour:.2}",
            controller.season(),
            weather
        );
        Ok(controller)
    }

    pub fn state(&self) -> EnvironmentState {
        EnvironmentState {
            season: self.season(),
            weather: self.weather,
            time_of_day: self.hour() / 24.0,
            day_index: self.day_index,
            phase: self.phase,
        }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn season(&self) -> Season {
        self.config.seasons[self.season_index].season
    }

    /// Current clock hour in `[0, 24)`.
    pub fn hour(&self) -> f64 {
        self.now - self.day_index as f64 * 24.0
    }

    /// Game hours until the current weather is redrawn.
    pub fn weather_remaining_hours(&self) -> f64 {
        self.weather_until - self.now
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Switch the biome whose weather table overrides the season's. Takes
    /// effect at the next weather draw.
    pub fn set_biome(&mut self, biome: Option<&str>) {
        self.biome = biome.map(str::to_string);
    }

    /// Advance by `dt_seconds` of real time.
    ///
    /// Every day rollover, phase boundary and weather expiry crossed on the
    /// way is handled in chronological order; events sharing an instant are
    /// emitted as day, season, phase, weather.
    pub fn advance(&mut self, dt_seconds: f64) -> Vec<EnvironmentEvent> {
        let mut events = Vec::new();
        if self.paused || !dt_seconds.is_finite() || dt_seconds <= 0.0 {
            return events;
        }
        let end = self.now + dt_seconds / 60.0 / self.config.minutes_per_game_hour;

        loop {
            let day_start = self.day_index as f64 * 24.0;
            let boundary = day_start + self.next_boundary();
            let next = boundary.min(self.weather_until);
            if next > end {
                break;
            }
            self.now = next;

            if boundary <= next {
                if boundary >= day_start + 24.0 {
                    self.roll_day(&mut events);
                }
                let phase = phase_at(&self.schedule, self.hour());
                if phase != self.phase {
                    debug!("Phase {:?} -> {phase:?} on day {}", self.phase, self.day_index);
                    events.push(EnvironmentEvent::PhaseChanged {
                        from: self.phase,
                        to: phase,
                        day: self.day_index,
                    });
                    self.phase = phase;
                }
            }

            if self.weather_until <= self.now {
                let (weather, duration) = self.draw_weather();
                self.weather_until = self.now + duration;
                if weather != self.weather {
                    info!("Weather {:?} -> {weather:?} for {duration:.1}h", self.weather);
                    events.push(EnvironmentEvent::WeatherChanged {
                        from: self.weather,
                        to: weather,
                        duration_hours: duration,
                    });
                    self.weather = weather;
                }
            }
        }
        self.now = end;
        events
    }

    /// Sun direction for the current hour (+Y up).
    pub fn sun_direction(&self) -> Vec3 {
        sun::sun_direction(sun::solar_fraction(
            self.hour(),
            self.config.sunrise_hour,
            self.config.sunset_hour,
        ))
    }

    /// Sun elevation above the horizon in degrees.
    pub fn sun_angle(&self) -> f32 {
        sun::sun_elevation_degrees(self.sun_direction())
    }

    /// Ground-level daylight in `[0, 1]`, including weather attenuation.
    pub fn daylight_factor(&self) -> f32 {
        sun::sun_intensity_curve(self.sun_direction()) * self.weather.light_factor()
    }

    pub fn ambient_intensity(&self) -> f32 {
        sun::ambient_intensity(self.sun_direction())
    }

    pub fn is_daytime(&self) -> bool {
        let hour = self.hour();
        hour >= self.config.sunrise_hour && hour < self.config.sunset_hour
    }

    fn next_boundary(&self) -> f64 {
        self.schedule
            .iter()
            .map(|&(start, _)| start)
            .find(|&start| start > self.hour())
            .unwrap_or(24.0)
    }

    fn roll_day(&mut self, events: &mut Vec<EnvironmentEvent>) {
        self.day_index += 1;
        events.push(EnvironmentEvent::DayStarted { day: self.day_index });
        self.day_of_season += 1;
        if self.day_of_season >= self.config.seasons[self.season_index].duration_days {
            let from = self.season();
            self.season_index = (self.season_index + 1) % self.config.seasons.len();
            self.day_of_season = 0;
            let to = self.season();
            info!("Season {from:?} -> {to:?} on day {}", self.day_index);
            events.push(EnvironmentEvent::SeasonChanged { from, to });
        }
    }

    fn weather_table(&self) -> &[WeatherOption] {
        self.biome
            .as_deref()
            .and_then(|biome| self.config.biome_weather.get(biome))
            .unwrap_or(&self.config.seasons[self.season_index].weather)
    }

    fn draw_weather(&mut self) -> (Weather, f64) {
        let mut rng = unit_rng(self.seed, StageTag::Environment, self.weather_draws);
        self.weather_draws += 1;
        let table = self.weather_table();
        let total: f64 = table.iter().map(|o| o.weight).sum();
        let mut pick = rng.random::<f64>() * total;
        let mut chosen = &table[table.len() - 1];
        for option in table {
            if option.weight > 0.0 && pick < option.weight {
                chosen = option;
                break;
            }
            pick -= option.weight;
        }
        let duration = if chosen.max_hours > chosen.min_hours {
            rng.random_range(chosen.min_hours..=chosen.max_hours)
        } else {
            chosen.min_hours
        };
        (chosen.weather, duration.max(self.config.min_hours_between_changes))
    }
}

fn phase_at(schedule: &[(f64, DayPhase); 6], hour: f64) -> DayPhase {
    schedule
        .iter()
        .rev()
        .find(|&&(start, _)| hour >= start)
        .map(|&(_, phase)| phase)
        .unwrap_or(DayPhase::Night)
}
