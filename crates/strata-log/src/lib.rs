//! Structured logging for the strata world generator.
//!
//! Console output carries an uptime timer and thread names so stage workers
//! and rayon threads can be told apart. Debug builds additionally write JSON
//! lines to `strata.log` for post-mortem analysis of long generation runs.

use std::path::{Path, PathBuf};

use strata_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names a level.
pub const DEFAULT_FILTER: &str = "info";

/// File name of the JSON log inside the log directory.
pub const LOG_FILE_NAME: &str = "strata.log";

/// Filter directive from the config's `debug.log_level`, or the default.
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Path the JSON file layer writes to, when file logging applies.
pub fn log_file_path(log_dir: Option<&Path>, debug_build: bool) -> Option<PathBuf> {
    if debug_build {
        log_dir.map(|dir| dir.join(LOG_FILE_NAME))
    } else {
        None
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the config's log level. The JSON file layer is only
/// added in debug builds, and only if the log directory can be created.
/// Calling this twice leaves the first subscriber in place.
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_directive(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(path) = log_file_path(log_dir, debug_build)
        && let Some(dir) = path.parent()
        && std::fs::create_dir_all(dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(&path)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::uptime())
            .json();

        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}
