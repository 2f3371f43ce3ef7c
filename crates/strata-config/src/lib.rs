//! Configuration for the strata world generator.
//!
//! Settings persist to disk as `worldgen.ron`. Every section uses
//! `#[serde(default)]`, so files written by older versions keep loading and
//! hand-written files only need the values they change. Command-line flags
//! parsed with clap override the loaded file.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE_NAME, Config, DebugConfig, OutputConfig, default_config_dir};
pub use error::ConfigFileError;
