//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed line {line}: {content}")]
    MalformedLine { line: usize, content: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid glob pattern {pattern}: {message}")]
    BadPattern { pattern: String, message: String },

    #[error("legacy cfg/nodes directory found; migrate node definitions to contexts")]
    LegacyNodes,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
