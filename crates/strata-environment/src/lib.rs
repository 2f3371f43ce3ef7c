//! Live world environment: day/night clock, seasons and seeded weather.
//!
//! Runs for the lifetime of a world session, independent of terrain
//! generation. The host calls [`EnvironmentCycleController::advance`] once per
//! frame with the real elapsed time and reacts to the returned events.

mod config;
mod controller;
mod error;
pub mod sun;

pub use config::{EnvironmentConfig, Season, SeasonConfig, Weather, WeatherOption};
pub use controller::{DayPhase, EnvironmentCycleController, EnvironmentEvent, EnvironmentState};
pub use error::EnvironmentError;
