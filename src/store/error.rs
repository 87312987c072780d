//! Storage errors
//!
//! Error taxonomy for storage and delivery operations. Idempotency
//! conflicts are classified from the driver's error kind, never from
//! message strings, so callers can swallow them without guessing.

/// Result alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unique violation on an idempotency key. Persist and snapshot writes
    /// swallow this at their operation boundary and report a successful
    /// no-op; it only escapes to callers of lower-level operations.
    #[error("Idempotency conflict: row already persisted")]
    IdempotencyConflict,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload codec error (compression or UTF-8)
    #[error("Payload error: {0}")]
    Payload(#[from] std::io::Error),

    /// Durable medium failed to store or load the database image
    #[error("Durable medium error: {0}")]
    Durable(#[source] std::io::Error),

    /// Event failed validation before the write started
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Aggregate id is not usable as a table identifier
    #[error("Invalid aggregate id: {0}")]
    InvalidAggregateId(String),

    /// Operation is not implemented by this backend
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// Transport failed to deliver a batch; outbox rows remain pending
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

impl StoreError {
    /// Check whether this error is a swallowed-class idempotency conflict
    pub fn is_idempotency_conflict(&self) -> bool {
        matches!(self, StoreError::IdempotencyConflict)
    }

    /// Check whether the operation may succeed if retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Delivery(_))
    }

    /// Classify a driver error, folding unique violations into
    /// [`StoreError::IdempotencyConflict`]
    pub(crate) fn classify(e: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(ref db) = e {
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
                return StoreError::IdempotencyConflict;
            }
        }
        StoreError::Database(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal driver error reporting a unique violation
    #[derive(Debug)]
    struct FakeUniqueViolation;

    impl std::fmt::Display for FakeUniqueViolation {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "duplicate key value violates unique constraint")
        }
    }

    impl std::error::Error for FakeUniqueViolation {}

    impl sqlx::error::DatabaseError for FakeUniqueViolation {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::UniqueViolation
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
    }

    #[test]
    fn test_idempotency_conflict_is_not_retryable() {
        let err = StoreError::IdempotencyConflict;
        assert!(err.is_idempotency_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_delivery_is_retryable() {
        let err = StoreError::Delivery("broker unavailable".into());
        assert!(err.is_retryable());
        assert!(!err.is_idempotency_conflict());
    }

    #[test]
    fn test_classify_folds_unique_violation_into_conflict() {
        let raw = sqlx::Error::Database(Box::new(FakeUniqueViolation));
        let err = StoreError::classify(raw);
        assert!(err.is_idempotency_conflict());
    }

    #[test]
    fn test_classify_passes_through_non_database_errors() {
        let err = StoreError::classify(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(_)));
    }
}
