use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not be used or written.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not JSON, or a key holds a value of the wrong type.
    #[error("{} is not a valid settings file: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("settings could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
    /// A key parsed but holds a value the server cannot run with.
    #[error("{key} {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: &'static str) -> Self {
        Self::Invalid { key, reason }
    }

    /// The offending settings key, for validation failures.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            Self::Invalid { key, .. } => Some(key),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
