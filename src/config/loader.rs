//! Settings file loader and serialization.

use crate::config::validator::validate_settings;
use crate::config::Settings;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the global settings path: ~/.config/k8s-provisioner/settings.json
pub fn get_global_settings_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine home directory".to_string())
    })?;

    let config_dir = home.join(".config/k8s-provisioner");
    Ok(config_dir.join("settings.json"))
}

/// Load settings from a JSON file.
pub fn load_settings_from_file(path: &Path) -> Result<Settings, ConfigError> {
    validate_settings_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!("Settings file not found at: {}", path.display()))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let settings: Settings = serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?;
    Ok(settings)
}

/// Save settings to a JSON file, creating parent directories.
pub fn save_settings_to_file(settings: &Settings, path: &Path) -> Result<(), ConfigError> {
    validate_settings_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }
    }

    let json_content = serde_json::to_string_pretty(settings).map_err(ConfigError::InvalidJson)?;
    fs::write(path, json_content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Load settings, falling back to defaults when the file does not exist.
pub fn load_or_default(path: &Path) -> Result<Settings, ConfigError> {
    match load_settings_from_file(path) {
        Ok(settings) => Ok(settings),
        Err(ConfigError::FileNotFound(_)) => {
            log::info!(
                "[Config] No settings at {}, using defaults",
                path.display()
            );
            Ok(Settings::default())
        }
        Err(e) => Err(e),
    }
}

/// Full pipeline: file (or defaults), environment overrides, validation.
///
/// `path` of `None` means the global settings path.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_global_settings_path()?,
    };
    let mut settings = load_or_default(&path)?;
    settings.apply_env_overrides()?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Validate settings path (.json extension required).
pub fn validate_settings_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Settings path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "json" => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Settings file must have .json extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Settings file must have .json extension".to_string(),
        )),
    }
}
