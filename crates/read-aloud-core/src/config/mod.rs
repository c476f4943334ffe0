//! Configuration for the reader runtime.
//!
//! Two records live here. `RuntimeConfig` is the operator-facing TOML file
//! (`conf/config.toml`) that tunes logging, worker timings and paths.
//! `Settings` is the user-facing record persisted through a `SettingsStore`;
//! it is owned by the options surface and only ever read by the core.

mod defaults;
mod models;
mod settings;

pub use models::{LogLevel, RuntimeConfig, WorkerMode, WorkerTimings};
pub use settings::{
    EnginePreference, FallbackEngine, MAX_NATIVE_RATE, MAX_SPEED, MIN_NATIVE_RATE, MIN_SPEED,
    RemoteParams, Settings,
};

use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Load configuration from the given path, falling back to defaults on error.
pub fn load_config(path: &Path) -> RuntimeConfig {
    let contents = match fs::read_to_string(path) {
        Ok(data) => {
            info!(path = %path.display(), "Loaded runtime config");
            data
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                "Falling back to default config: {err}"
            );
            return RuntimeConfig::default();
        }
    };

    match parse_config(&contents) {
        Ok(cfg) => {
            debug!("Parsed configuration from disk");
            cfg
        }
        Err(err) => {
            warn!(path = %path.display(), "Invalid config TOML: {err}");
            RuntimeConfig::default()
        }
    }
}

pub fn parse_config(contents: &str) -> Result<RuntimeConfig, toml::de::Error> {
    toml::from_str::<RuntimeConfig>(contents)
}
