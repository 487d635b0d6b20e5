//! qf-settings: user-facing settings file format, migration and validation.

pub mod home;
pub mod legacy;
pub mod migrate;
pub mod schema;
pub mod validate;

use std::path::Path;

pub use home::{records_dir, resolve_base_directory, runs_dir, settings_path};
pub use legacy::LegacyConfig;
pub use migrate::{LATEST_VERSION, migrate_to_latest};
pub use schema::*;
pub use validate::{ValidationError, validate_settings};

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Migration error: {what}")]
    Migration { what: String },

    #[error("Unsupported settings format: {path}")]
    UnsupportedFormat { path: String },

    #[error(transparent)]
    Core(#[from] qf_core::CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

enum Format {
    Yaml,
    Json,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => Ok(Format::Yaml),
        Some("json") => Ok(Format::Json),
        _ => Err(SettingsError::UnsupportedFormat {
            path: path.display().to_string(),
        }),
    }
}

pub fn load_yaml(path: &Path) -> SettingsResult<Settings> {
    let content = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_yaml::from_str(&content)?;
    settings = migrate_to_latest(settings)?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn save_yaml(path: &Path, settings: &Settings) -> SettingsResult<()> {
    validate_settings(settings)?;
    let content = serde_yaml::to_string(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Loads a JSON settings file; flat GUI configuration files are converted.
pub fn load_json(path: &Path) -> SettingsResult<Settings> {
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    let mut settings = if LegacyConfig::looks_like(&value) {
        serde_json::from_value::<LegacyConfig>(value)?.into_settings()?
    } else {
        serde_json::from_value::<Settings>(value)?
    };
    settings = migrate_to_latest(settings)?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn save_json(path: &Path, settings: &Settings) -> SettingsResult<()> {
    validate_settings(settings)?;
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load by file extension (`.yaml`/`.yml` or `.json`).
pub fn load(path: &Path) -> SettingsResult<Settings> {
    match format_of(path)? {
        Format::Yaml => load_yaml(path),
        Format::Json => load_json(path),
    }
}

/// Save by file extension, creating the parent directory if needed.
pub fn save(path: &Path, settings: &Settings) -> SettingsResult<()> {
    let format = format_of(path)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    match format {
        Format::Yaml => save_yaml(path, settings),
        Format::Json => save_json(path, settings),
    }
}

/// Load if the file exists, otherwise return defaults.
pub fn load_or_default(path: &Path) -> SettingsResult<Settings> {
    if path.exists() {
        load(path)
    } else {
        Ok(Settings::default())
    }
}
