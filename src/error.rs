//! Error types for the wardflow crate.
//!
//! A single non-exhaustive enum covers the four failure families the
//! workflow core distinguishes: validation failures surfaced to the actor,
//! conflicts with a concurrent writer, storage failures, and the degraded
//! sequence mode of the number issuer.

use thiserror::Error;

/// Generic message shown to an actor when storage fails.
pub const STORAGE_FAILURE_MESSAGE: &str = "Operation failed, please retry";

/// Message shown to an actor whose completion lost a race.
pub const CONFLICT_MESSAGE: &str = "Already completed by another user";

/// The main error type for wardflow operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WardflowError {
    /// Input was rejected before any state was written.
    ///
    /// The message is human readable and specific to the failed check.
    #[error("{0}")]
    Validation(String),

    /// Another actor completed the same stage first.
    #[error("Stage {stage} of {id} was already completed by another writer")]
    Conflict {
        /// Record or task identifier.
        id: String,
        /// Stage index that was contested.
        stage: u8,
    },

    /// A write carried a row version that is no longer current.
    #[error("Stale write for {id}: expected version {expected}, found {found}")]
    StaleWrite {
        /// Record or task identifier.
        id: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// An issued identifier collided with an existing row.
    #[error("Duplicate identifier: {0}")]
    DuplicateNumber(String),

    /// The number issuer could not read its sequence and fell back to a
    /// time-derived identifier.
    #[error("Sequence degraded for scope {0}")]
    SequenceDegraded(String),

    /// Error occurred in the storage layer.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Pipeline record not found.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Task assignment not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Stage index not defined by the pipeline.
    #[error("Stage not found: {0}")]
    StageNotFound(u8),

    /// Pipeline definition is invalid.
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Configuration value out of range or unparsable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from file or database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error (for the SQLite store).
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(String),
}

impl WardflowError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true if another writer won the race for this stage.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true for locally recoverable input errors.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true for I/O-class failures the actor retries by resubmitting.
    pub fn is_storage(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => true,
            #[cfg(feature = "sqlite")]
            Self::Database(_) => true,
            _ => false,
        }
    }

    /// Message suitable for showing to the acting user.
    ///
    /// Validation errors keep their specific wording; storage failures are
    /// collapsed to a generic retry prompt.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Conflict { .. } => CONFLICT_MESSAGE.to_string(),
            Self::RecordNotFound(_) | Self::TaskNotFound(_) => {
                "The selected entry no longer exists".to_string()
            }
            _ => STORAGE_FAILURE_MESSAGE.to_string(),
        }
    }
}

/// A specialized `Result` type for wardflow operations.
pub type Result<T> = std::result::Result<T, WardflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_is_message() {
        let error = WardflowError::validation("Please upload the report");
        assert_eq!(error.to_string(), "Please upload the report");
        assert!(error.is_validation());
        assert_eq!(error.user_message(), "Please upload the report");
    }

    #[test]
    fn test_conflict_display() {
        let error = WardflowError::Conflict {
            id: "LAB-001".to_string(),
            stage: 2,
        };
        assert_eq!(
            error.to_string(),
            "Stage 2 of LAB-001 was already completed by another writer"
        );
        assert!(error.is_conflict());
        assert!(!error.is_storage());
        assert_eq!(error.user_message(), CONFLICT_MESSAGE);
    }

    #[test]
    fn test_stale_write_display() {
        let error = WardflowError::StaleWrite {
            id: "TASK-004".to_string(),
            expected: 2,
            found: 3,
        };
        assert_eq!(
            error.to_string(),
            "Stale write for TASK-004: expected version 2, found 3"
        );
    }

    #[test]
    fn test_storage_message_is_generic() {
        let error = WardflowError::Storage("disk full at /var/lib".to_string());
        assert!(error.is_storage());
        assert_eq!(error.user_message(), STORAGE_FAILURE_MESSAGE);
        assert!(error.to_string().contains("disk full"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: WardflowError = json_error.into();
        assert!(error.to_string().contains("Serialization error"));
        assert!(error.is_storage());
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: WardflowError = io_error.into();
        assert!(error.to_string().contains("I/O error"));
    }

    #[test]
    fn test_not_found_message() {
        let error = WardflowError::TaskNotFound("TASK-999".to_string());
        assert_eq!(error.user_message(), "The selected entry no longer exists");
    }
}
