//! Error types for the Shiori reader core.
//!
//! Uses `thiserror` for structured error definitions that provide
//! clear context about what went wrong.

use thiserror::Error;

/// Error type for content repository operations.
#[derive(Error, Debug)]
pub enum ContentError {
    /// Failed to read a chapter or metadata file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse book metadata
    #[error("Failed to parse book metadata: {0}")]
    Parse(String),

    /// Failed to encode or decode reading progress
    #[error("Failed to handle reading progress: {0}")]
    Progress(#[from] serde_json::Error),

    /// Book or chapter not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error type for the chapter loader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// The loader generation was cancelled by a reload
    #[error("Load cancelled by reload")]
    Cancelled,

    /// The chapter index is outside the ordered chapter list
    #[error("Invalid chapter index: {0}")]
    InvalidChapter(usize),
}

/// Error type for configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Invalid config value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Config directory not found
    #[error("Could not determine config directory")]
    NoConfigDir,
}
