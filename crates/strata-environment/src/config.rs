//! Tunables for the season, weather and day/night cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_terrain::BiomeTable;

use crate::error::EnvironmentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    Spring,
    Summer,
    Autumn,
    Winter,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weather {
    #[default]
    Clear,
    Cloudy,
    Rainy,
    Stormy,
    Foggy,
    Snowy,
    Blizzard,
}

impl Weather {
    /// Fraction of direct sunlight that reaches the ground.
    pub fn light_factor(self) -> f32 {
        match self {
            Self::Clear => 1.0,
            Self::Cloudy => 0.75,
            Self::Foggy => 0.6,
            Self::Rainy | Self::Snowy => 0.55,
            Self::Stormy | Self::Blizzard => 0.35,
        }
    }

    pub fn is_stormy(self) -> bool {
        matches!(self, Self::Stormy | Self::Blizzard)
    }

    pub fn is_snowy(self) -> bool {
        matches!(self, Self::Snowy | Self::Blizzard)
    }
}

/// One entry of a weighted weather table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeatherOption {
    pub weather: Weather,
    pub weight: f64,
    /// Game hours the weather lasts, drawn uniformly from `[min_hours, max_hours]`.
    pub min_hours: f64,
    pub max_hours: f64,
}

impl WeatherOption {
    pub fn new(weather: Weather, weight: f64, min_hours: f64, max_hours: f64) -> Self {
        Self {
            weather,
            weight,
            min_hours,
            max_hours,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeasonConfig {
    pub season: Season,
    pub duration_days: u32,
    pub weather: Vec<WeatherOption>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Real minutes per in-game hour.
    pub minutes_per_game_hour: f64,
    /// Hour of day the clock starts at.
    pub start_hour: f64,
    pub sunrise_hour: f64,
    pub sunset_hour: f64,
    /// Lower bound on any drawn weather duration, in game hours.
    pub min_hours_between_changes: f64,
    /// Cycled in order; the first entry is the starting season.
    pub seasons: Vec<SeasonConfig>,
    /// Weather tables that replace the season table while the player is in
    /// the named biome.
    pub biome_weather: BTreeMap<String, Vec<WeatherOption>>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        use Weather::*;
        let season = |season, weather| SeasonConfig {
            season,
            duration_days: 7,
            weather,
        };
        Self {
            minutes_per_game_hour: 2.0,
            start_hour: 8.0,
            sunrise_hour: 6.0,
            sunset_hour: 19.0,
            min_hours_between_changes: 2.0,
            seasons: vec![
                season(
                    Season::Spring,
                    vec![
                        WeatherOption::new(Clear, 4.0, 4.0, 10.0),
                        WeatherOption::new(Cloudy, 3.0, 3.0, 8.0),
                        WeatherOption::new(Rainy, 3.0, 2.0, 6.0),
                        WeatherOption::new(Foggy, 1.0, 2.0, 4.0),
                    ],
                ),
                season(
                    Season::Summer,
                    vec![
                        WeatherOption::new(Clear, 6.0, 6.0, 14.0),
                        WeatherOption::new(Cloudy, 2.0, 3.0, 6.0),
                        WeatherOption::new(Stormy, 1.0, 1.0, 3.0),
                    ],
                ),
                season(
                    Season::Autumn,
                    vec![
                        WeatherOption::new(Clear, 3.0, 4.0, 8.0),
                        WeatherOption::new(Cloudy, 3.0, 4.0, 10.0),
                        WeatherOption::new(Rainy, 3.0, 3.0, 8.0),
                        WeatherOption::new(Foggy, 2.0, 2.0, 6.0),
                        WeatherOption::new(Stormy, 1.0, 1.0, 4.0),
                    ],
                ),
                season(
                    Season::Winter,
                    vec![
                        WeatherOption::new(Clear, 3.0, 4.0, 8.0),
                        WeatherOption::new(Cloudy, 2.0, 4.0, 8.0),
                        WeatherOption::new(Snowy, 4.0, 3.0, 10.0),
                        WeatherOption::new(Blizzard, 1.0, 1.0, 4.0),
                    ],
                ),
            ],
            biome_weather: BTreeMap::from([
                (
                    "desert".to_string(),
                    vec![
                        WeatherOption::new(Clear, 8.0, 8.0, 16.0),
                        WeatherOption::new(Stormy, 1.0, 1.0, 3.0),
                    ],
                ),
                (
                    "tundra".to_string(),
                    vec![
                        WeatherOption::new(Cloudy, 2.0, 4.0, 8.0),
                        WeatherOption::new(Snowy, 4.0, 4.0, 12.0),
                        WeatherOption::new(Blizzard, 2.0, 2.0, 6.0),
                    ],
                ),
            ]),
        }
    }
}

impl EnvironmentConfig {
    pub fn validate(&self) -> Result<(), EnvironmentError> {
        if !(self.minutes_per_game_hour.is_finite() && self.minutes_per_game_hour > 0.0) {
            return Err(EnvironmentError::invalid(
                "minutes_per_game_hour",
                "must be a positive number",
            ));
        }
        if !(0.0..24.0).contains(&self.start_hour) {
            return Err(EnvironmentError::invalid("start_hour", "must be in [0, 24)"));
        }
        // Every phase needs room: one hour either side of sunrise, noon and sunset.
        if self.sunrise_hour < 1.0 || self.sunset_hour > 23.0 {
            return Err(EnvironmentError::invalid(
                "sunrise_hour",
                "sunrise must be at least 1 and sunset at most 23",
            ));
        }
        if self.sunset_hour - self.sunrise_hour < 6.0 {
            return Err(EnvironmentError::invalid(
                "sunset_hour",
                "must be at least 6 hours after sunrise",
            ));
        }
        if !(self.min_hours_between_changes.is_finite() && self.min_hours_between_changes >= 0.0) {
            return Err(EnvironmentError::invalid(
                "min_hours_between_changes",
                "must be non-negative",
            ));
        }
        if self.seasons.is_empty() {
            return Err(EnvironmentError::NoSeasons);
        }
        for (i, season) in self.seasons.iter().enumerate() {
            if season.duration_days == 0 {
                return Err(EnvironmentError::invalid(
                    format!("seasons[{i}].duration_days"),
                    "must be at least 1",
                ));
            }
            validate_table(&format!("seasons[{i}].weather"), &season.weather)?;
        }
        for (biome, table) in &self.biome_weather {
            validate_table(&format!("biome_weather.{biome}"), table)?;
        }
        Ok(())
    }

    /// Check that every biome override names a biome of `table`.
    pub fn check_biomes(&self, table: &BiomeTable) -> Result<(), EnvironmentError> {
        match self
            .biome_weather
            .keys()
            .find(|name| table.registry().lookup_by_name(name).is_none())
        {
            Some(name) => Err(EnvironmentError::UnknownBiome(name.clone())),
            None => Ok(()),
        }
    }
}

fn validate_table(field: &str, table: &[WeatherOption]) -> Result<(), EnvironmentError> {
    if table.is_empty() {
        return Err(EnvironmentError::invalid(field, "weather table is empty"));
    }
    let mut total = 0.0;
    for option in table {
        if !(option.weight.is_finite() && option.weight >= 0.0) {
            return Err(EnvironmentError::invalid(field, "weights must be non-negative"));
        }
        if !(option.min_hours > 0.0 && option.max_hours >= option.min_hours) {
            return Err(EnvironmentError::invalid(
                field,
                format!("{:?}: need 0 < min_hours <= max_hours", option.weather),
            ));
        }
        total += option.weight;
    }
    if total <= 0.0 {
        return Err(EnvironmentError::invalid(field, "total weight must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(EnvironmentConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_default_overrides_match_default_biomes() {
        let table = strata_terrain::BiomeRuleTable::default().compile().unwrap();
        assert_eq!(EnvironmentConfig::default().check_biomes(&table), Ok(()));
    }

    #[test]
    fn test_unknown_biome_override_rejected() {
        let table = strata_terrain::BiomeRuleTable::default().compile().unwrap();
        let mut config = EnvironmentConfig::default();
        config
            .biome_weather
            .insert("volcano".into(), vec![WeatherOption::new(Weather::Foggy, 1.0, 1.0, 2.0)]);
        assert_eq!(
            config.check_biomes(&table),
            Err(EnvironmentError::UnknownBiome("volcano".into()))
        );
    }

    #[test]
    fn test_rejects_bad_tables() {
        let mut config = EnvironmentConfig::default();
        config.seasons[1].weather[0].max_hours = 0.5;
        assert!(config.validate().is_err(), "max below min should be rejected");

        let mut config = EnvironmentConfig::default();
        config.seasons[0].weather.iter_mut().for_each(|w| w.weight = 0.0);
        assert!(config.validate().is_err(), "all-zero weights should be rejected");

        let mut config = EnvironmentConfig::default();
        config.seasons.clear();
        assert_eq!(config.validate(), Err(EnvironmentError::NoSeasons));
    }

    #[test]
    fn test_rejects_cramped_daylight() {
        let config = EnvironmentConfig {
            sunrise_hour: 9.0,
            sunset_hour: 13.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_parses_from_ron() {
        let text = "(minutes_per_game_hour: 1.0, sunrise_hour: 5.0)";
        let config: EnvironmentConfig = ron::from_str(text).unwrap();
        assert_eq!(config.minutes_per_game_hour, 1.0);
        assert_eq!(config.sunrise_hour, 5.0);
        assert_eq!(config.seasons.len(), 4, "Missing fields should use defaults");
    }
}
