//! Error types for MDP

use thiserror::Error;

/// Result type alias for MDP operations
pub type Result<T> = std::result::Result<T, MdpError>;

/// Main error type for the ambient layer (environment, files, encoding)
#[derive(Error, Debug)]
pub enum MdpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
}

impl MdpError {
    /// Build an [`MdpError::InvalidSetting`] from anything displayable
    pub fn invalid_setting(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        MdpError::InvalidSetting {
            key: key.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

/// Read an optional environment variable and parse it, reporting the key on failure.
pub fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| MdpError::invalid_setting(key, raw, e)),
        Err(_) => Ok(None),
    }
}
