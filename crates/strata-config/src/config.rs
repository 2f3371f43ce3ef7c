//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_environment::EnvironmentConfig;
use strata_terrain::{GenerationRequest, OrchestratorConfig};

use crate::error::ConfigFileError;

pub const CONFIG_FILE_NAME: &str = "worldgen.ron";

/// `<platform config dir>/strata`, or `./strata` when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
}

/// Top-level generator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The generation request: seed, extent and every stage's tunables.
    pub request: GenerationRequest,
    /// Thread pools used by the orchestrator.
    pub runtime: OrchestratorConfig,
    /// Where and what to write after a run.
    pub output: OutputConfig,
    /// Day/night, season and weather cycle.
    pub environment: EnvironmentConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving debug images and saved worlds.
    pub output_dir: PathBuf,
    /// Write elevation and biome PNGs with overlays.
    pub debug_images: bool,
    /// Persist the full result through the save manager.
    pub save_results: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("worldgen-out"),
            debug_images: true,
            save_results: false,
        }
    }
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigFileError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `worldgen.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigFileError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigFileError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(4)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigFileError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigFileError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigFileError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE_NAME))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigFileError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigFileError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigFileError::ParseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(4))
                .unwrap();
        assert!(!ron_str.is_empty());
        assert!(ron_str.contains("world_id: \"world\""));
        assert!(ron_str.contains("stage_workers: 3"));
    }

    #[test]
    fn test_default_request_is_valid() {
        assert_eq!(Config::default().request.validate(), Ok(()));
        assert_eq!(Config::default().environment.validate(), Ok(()));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let ron_str = "(request: (seed: 42, extent: (width: 64, height: 32)), debug: (log_level: \"debug\"))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.request.seed, 42);
        assert_eq!(config.request.extent.width, 64);
        assert_eq!(config.request.extent.height, 32);
        assert_eq!(config.debug.log_level, "debug");
        assert_eq!(config.runtime, OrchestratorConfig::default());
        assert_eq!(config.request.cell_size, 1.0, "Unset request fields keep defaults");
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        // RON with #[serde(default)] and deny_unknown_fields not set should accept this
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.request = config.request.with_seed(7).with_extent(96, 64);
        config.runtime.worker_threads = 2;
        config.output.save_results = true;

        config.save(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE_NAME).exists(), "Default file should be created");
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.request.seed = 1234;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().request.seed, 1234);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigFileError::ParseError(_))));
    }

    #[test]
    fn test_ron_comments_accepted() {
        let ron_str = "// World settings\n(\n  // Nothing overridden\n)";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_default_config_dir_ends_with_strata() {
        assert!(default_config_dir().ends_with("strata"));
    }
}
