// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for Rotor

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Rotor operations
pub type Result<T> = std::result::Result<T, RotorError>;

/// Errors that can occur while provisioning or patching
#[derive(Error, Debug)]
pub enum RotorError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration (bad settings, undersized domain pool, ...)
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The service-definition document does not have the expected shape
    #[error("Invalid service document: {message}")]
    InvalidDocument { message: String },

    /// The same inbound tag appears more than once
    #[error("Duplicate inbound tag: {tag}")]
    DuplicateTag { tag: String },

    /// Audit store schema does not match the inbound rule table
    #[error("Audit schema mismatch in table '{table}': expected [{expected}], found [{found}]")]
    SchemaMismatch {
        table: String,
        expected: String,
        found: String,
    },

    /// A mutation run did not produce a value for every audited tag
    #[error("Change set is missing values for: {missing}")]
    IncompleteChangeSet { missing: String },

    /// IO error tied to a specific file
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// SQLite error
    #[error("Audit store error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// Pattern compilation error
    #[error("Pattern error: {0}")]
    RegexError(#[from] regex::Error),
}

impl RotorError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }
}
