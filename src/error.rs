//! Unified error handling for the group-tracker library.
//!
//! Most runtime failures in this crate recover to a local fallback and are
//! only logged. The variants here cover what can still escape: construction
//! (config, HTTP client, SQLite) and the results carried back from network
//! requests before a resolver decides to swallow them.

use thiserror::Error;

/// Unified error type for group-tracker operations.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    /// Entity has no usable position
    #[error("Entity '{entity_id}' has no valid position")]
    MissingPosition { entity_id: String },

    /// Entity is not known to the store
    #[error("Entity '{entity_id}' not found")]
    UnknownEntity { entity_id: String },

    /// Road-routing service failure
    #[error("Routing error{}: {message}", status_suffix(.status_code))]
    Routing {
        message: String,
        status_code: Option<u16>,
    },

    /// Device location failure
    #[error("Location unavailable: {0}")]
    Location(#[from] crate::location::LocationError),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackerError {
    fn from(err: rusqlite::Error) -> Self {
        TrackerError::Persistence {
            message: err.to_string(),
        }
    }
}

/// Result type alias for group-tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a missing position error.
    fn ok_or_missing_position(self, entity_id: &str) -> Result<T>;

    /// Convert Option to Result with an unknown entity error.
    fn ok_or_unknown_entity(self, entity_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_missing_position(self, entity_id: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::MissingPosition {
            entity_id: entity_id.to_string(),
        })
    }

    fn ok_or_unknown_entity(self, entity_id: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::UnknownEntity {
            entity_id: entity_id.to_string(),
        })
    }
}
