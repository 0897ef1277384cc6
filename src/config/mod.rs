// Configuration module for frame-telemetry
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TelemetryConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<TelemetryConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Allow environment variables to override config values
pub fn apply_env_overrides(config: &mut TelemetryConfig) {
    if let Ok(root) = std::env::var("TELEMETRY_ROOT") {
        config.recorder.telemetry_root = root;
    }

    if let Ok(url) = std::env::var("TELEMETRY_STORE_URL") {
        if let Some(rest) = config.storage.backend_config.as_rest_mut() {
            rest.url = url;
        }
    }

    if let Ok(token) = std::env::var("TELEMETRY_AUTH_TOKEN") {
        if let Some(rest) = config.storage.backend_config.as_rest_mut() {
            rest.auth_token = Some(token);
        }
    }
}
