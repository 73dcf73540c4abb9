// Engine settings
// Loaded from ~/.config/cellbook/engine.toml, or passed in directly by the caller

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to write config: {0}")]
    Write(String),
}

/// When formulas are recomputed after an edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecalcMode {
    /// Dependents of an edited cell are recomputed immediately (default)
    #[default]
    Automatic,
    /// Dependents are left unevaluated until an explicit recalculation
    Manual,
}

/// Epoch used for date serial numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateSystem {
    #[default]
    #[serde(rename = "1900")]
    Excel1900,
    #[serde(rename = "1904")]
    Excel1904,
}

/// Grid size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_rows: usize,
    pub max_cols: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_rows: 1_048_576,
            max_cols: 16_384,
        }
    }
}

/// Delimited text defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    /// Field delimiter; None = detect from content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    /// Treat the first row as column names when converting to tables
    pub has_headers: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            has_headers: true,
        }
    }
}

/// Password protection parameters for the binary container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionOptions {
    /// Hash iterations used to derive the key from the password
    pub spin_count: u32,
}

impl Default for EncryptionOptions {
    fn default() -> Self {
        Self { spin_count: 100_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub recalc: RecalcMode,
    pub date_system: DateSystem,
    /// Opaque license key carried for front ends; the engine never checks it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    pub limits: Limits,
    pub csv: CsvOptions,
    pub encryption: EncryptionOptions,
}

impl EngineConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cellbook")
            .join("engine.toml")
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))
    }

    /// Load settings from a specific file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load from the default location, falling back to defaults when the
    /// file is missing or unreadable
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
        }
        let text = self.to_toml_string()?;
        fs::write(path, text).map_err(|e| ConfigError::Write(e.to_string()))
    }

    /// Automatic recalculation enabled
    pub fn auto_recalc(&self) -> bool {
        self.recalc == RecalcMode::Automatic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.auto_recalc());
        assert_eq!(config.limits.max_rows, 1_048_576);
        assert_eq!(config.limits.max_cols, 16_384);
        assert_eq!(config.encryption.spin_count, 100_000);
        assert_eq!(config.date_system, DateSystem::Excel1900);
        assert!(config.license_key.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            recalc = "manual"
            date_system = "1904"

            [csv]
            delimiter = ";"
            "#,
        )
        .unwrap();
        assert_eq!(config.recalc, RecalcMode::Manual);
        assert_eq!(config.date_system, DateSystem::Excel1904);
        assert_eq!(config.csv.delimiter, Some(';'));
        assert!(config.csv.has_headers);
        assert_eq!(config.limits, Limits::default());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("recalc = \"sometimes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let mut config = EngineConfig::default();
        config.limits.max_rows = 5000;
        config.license_key = Some("KEY-123".into());
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
