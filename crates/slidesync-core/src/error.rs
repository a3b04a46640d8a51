//! Error types for slidesync-core

use thiserror::Error;

use crate::models::{Destination, EntityType};

/// Result type alias using slidesync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in slidesync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or ledger entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another row already owns the natural key
    #[error("Natural key '{natural_key}' already exists for {entity}")]
    UniqueViolation {
        entity: EntityType,
        natural_key: String,
    },

    /// Constraint failure other than natural key uniqueness
    #[error("Integrity error for {entity} '{natural_key}': {message}")]
    IntegrityViolation {
        entity: EntityType,
        natural_key: String,
        message: String,
    },

    /// Destination failed its reachability check
    #[error("Destination {destination} is unreachable: {reason}")]
    Unreachable {
        destination: Destination,
        reason: String,
    },

    /// Adapter call exceeded the per-call timeout
    #[error("{operation} on {destination} timed out")]
    Timeout {
        destination: Destination,
        operation: &'static str,
    },

    /// A programming invariant was violated (fatal at startup validation)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The engine is shutting down and refuses new work
    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Whether the error means the whole destination should be skipped this cycle.
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    pub const fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }

    pub const fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::IntegrityViolation { .. })
    }

    /// Classify a raw libSQL failure raised while writing `natural_key`.
    ///
    /// Local and remote (Hrana) connections report constraint failures with
    /// different codes but the same SQLite message text, so matching is done
    /// on the message.
    pub fn from_write_failure(error: libsql::Error, entity: EntityType, natural_key: &str) -> Self {
        let message = error.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("unique constraint failed") {
            Self::UniqueViolation {
                entity,
                natural_key: natural_key.to_string(),
            }
        } else if lowered.contains("constraint failed") {
            Self::IntegrityViolation {
                entity,
                natural_key: natural_key.to_string(),
                message,
            }
        } else {
            Self::LibSql(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_unique_constraint_messages() {
        let error = Error::from_write_failure(
            libsql::Error::SqliteFailure(
                2067,
                "UNIQUE constraint failed: users.natural_key".to_string(),
            ),
            EntityType::User,
            "alice",
        );
        assert!(error.is_unique_violation());
    }

    #[test]
    fn classifies_other_constraints_as_integrity_errors() {
        let error = Error::from_write_failure(
            libsql::Error::SqliteFailure(1299, "NOT NULL constraint failed: users.payload".into()),
            EntityType::User,
            "alice",
        );
        assert!(error.is_integrity_violation());
        assert!(!error.is_unreachable());
    }

    #[test]
    fn timeouts_count_as_unreachable() {
        let error = Error::Timeout {
            destination: Destination::External,
            operation: "upsert",
        };
        assert!(error.is_unreachable());
        assert_eq!(error.to_string(), "upsert on EXTERNAL timed out");
    }
}
