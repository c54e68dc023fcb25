//! Configuration management for Shiori.
//!
//! Handles loading, saving, and validating configuration from
//! platform-specific config directories.

use crate::error::ConfigError;
use crate::loader::DEFAULT_TRANSLATION_CONCURRENCY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application name used for config directory.
const APP_NAME: &str = "Shiori";

/// Default config filename.
const CONFIG_FILENAME: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Reader behavior settings.
    pub reader: ReaderConfig,

    /// Narration settings.
    pub speech: SpeechConfig,

    /// File paths.
    pub paths: PathsConfig,
}

/// Reader behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Chapters loaded after the initial one when paging through a book.
    pub chapters_ahead: usize,

    /// Paragraphs translated concurrently while live translation is on.
    pub translation_concurrency: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chapters_ahead: 3,
            translation_concurrency: DEFAULT_TRANSLATION_CONCURRENCY,
        }
    }
}

/// Narration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Voice id; the engine default is used when unset.
    pub voice: Option<String>,

    /// Narration speed.
    pub words_per_minute: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            voice: None,
            words_per_minute: 180,
        }
    }
}

/// File path configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding book directories.
    pub library_directory: Option<PathBuf>,
}

impl Config {
    /// Returns the platform-specific config directory path.
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Returns the full path to the config file.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILENAME))
    }

    /// Loads configuration from the default location.
    ///
    /// If the config file doesn't exist, creates a default one.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(config)
    }

    /// Saves configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.speech.words_per_minute == 0 {
            return Err(ConfigError::InvalidValue {
                key: "speech.words_per_minute".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.reader.translation_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reader.translation_concurrency".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the effective library directory, using config or default.
    pub fn library_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(ref dir) = self.paths.library_directory {
            Ok(dir.clone())
        } else {
            Ok(Self::config_dir()?.join("library"))
        }
    }
}
