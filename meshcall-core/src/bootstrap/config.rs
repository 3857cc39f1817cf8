//! Configuration loading

use anyhow::Result;

use crate::{Config, Error};

/// Load configuration from an explicit path, a config file, or environment variables
///
/// Config file search order:
/// 1. `explicit` argument (e.g. from the command line)
/// 2. `MESHCALL_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. Fall back to environment variables only
///
/// Logging is not initialized yet when this runs, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config_path = explicit
        .map(ToString::to_string)
        .or_else(|| {
            std::env::var("MESHCALL_CONFIG_PATH")
                .ok()
                .filter(|p| std::path::Path::new(p).exists())
        })
        .or_else(|| {
            let cwd = "config.yaml";
            if std::path::Path::new(cwd).exists() {
                Some(cwd.to_string())
            } else {
                None
            }
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)
            .map_err(|e| Error::Configuration(format!("failed to load {path}: {e}")))?
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from environment: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(Error::Configuration(format!(
            "validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ))
        .into());
    }

    Ok(config)
}
