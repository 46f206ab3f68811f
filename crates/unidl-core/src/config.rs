//! Settings persistence
//!
//! Settings live in `config.toml` under the platform config directory.
//! Missing keys fall back to their defaults.

use crate::error::UnidlError;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use unidl_types::Settings;

pub type Result<T> = std::result::Result<T, UnidlError>;

/// Default location of the config file
pub fn config_path() -> Result<PathBuf> {
    ProjectDirs::from("", "", "unidl")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .ok_or_else(|| UnidlError::Config("cannot determine the config directory".into()))
}

/// Load settings from the default location, writing defaults if the file is missing
pub fn load_or_init() -> Result<Settings> {
    let path = config_path()?;
    if !path.exists() {
        let settings = Settings::default();
        save_to(&path, &settings)?;
        info!("created default config at {}", path.display());
        return Ok(settings);
    }
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<Settings> {
    let data = fs::read_to_string(path)?;
    let settings: Settings = toml::from_str(&data)
        .map_err(|e| UnidlError::Config(format!("{}: {}", path.display(), e)))?;
    validate(&settings)?;
    Ok(settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<()> {
    let toml = toml::to_string_pretty(settings).map_err(|e| UnidlError::Config(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml)?;
    Ok(())
}

pub fn validate(settings: &Settings) -> Result<()> {
    settings.validate().map_err(UnidlError::InvalidConfig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_roundtrip_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let settings = Settings {
            max_concurrent_downloads: 3,
            download_folder: dir.path().join("out"),
            ..Settings::default()
        };

        save_to(&path, &settings).unwrap();
        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
                max_concurrent_downloads = 2
                job_timeout_seconds = 30
            "#,
        )
        .unwrap();

        let settings = load_from(&path).unwrap();
        assert_eq!(settings.max_concurrent_downloads, 2);
        assert_eq!(settings.job_timeout_seconds, 30);
        assert_eq!(settings.rate_limit_max_requests, 10);
        assert_eq!(settings.sweep_interval_seconds, 300);
    }

    #[test]
    fn speed_limit_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "download_speed_limit_kbps = 256\n").unwrap();
        assert_eq!(load_from(&path).unwrap().speed_limit_bps(), Some(256 * 1024));

        fs::write(&path, "max_retries = 1\n").unwrap();
        assert_eq!(load_from(&path).unwrap().download_speed_limit_kbps, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_concurrent_downloads = 0\n").unwrap();
        assert!(matches!(load_from(&path), Err(UnidlError::InvalidConfig(_))));

        fs::write(&path, "job_retention_hours = 10000000000\n").unwrap();
        assert!(matches!(load_from(&path), Err(UnidlError::InvalidConfig(_))));

        fs::write(&path, "max_concurrent_downloads = \"many\"\n").unwrap();
        assert!(matches!(load_from(&path), Err(UnidlError::Config(_))));
    }
}
