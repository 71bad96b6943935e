//! Error types for Sonance

use thiserror::Error;

/// The main error type for Sonance operations
#[derive(Debug, Error)]
pub enum SonanceError {
    #[error("Decode error for '{asset}': {reason}")]
    Decode { asset: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Audio error: {0}")]
    AudioError(String),
}

/// Result type alias for Sonance operations
pub type Result<T> = std::result::Result<T, SonanceError>;

impl From<toml::de::Error> for SonanceError {
    fn from(err: toml::de::Error) -> Self {
        SonanceError::TomlParseError(err.to_string())
    }
}

impl From<serde_json::Error> for SonanceError {
    fn from(err: serde_json::Error) -> Self {
        SonanceError::JsonParseError(err.to_string())
    }
}
