// Error handling framework for the reminder dispatch engine

use thiserror::Error;

/// Event store, identity directory and ledger store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Failures while expanding an event into recipients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Event {event_id} has no owner")]
    OwnerMissing { event_id: String },

    #[error("Owner {owner_id} of event {event_id} could not be resolved")]
    OwnerUnresolved { event_id: String, owner_id: String },

    #[error("Identity directory error: {0}")]
    Directory(#[from] StorageError),
}

/// Channel transport failures. All of these are recorded as FAILED deliveries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport call timed out after {0} seconds")]
    Timeout(u64),

    #[error("Provider rejected the message with status {status}: {payload}")]
    Rejected { status: u16, payload: String },

    #[error("Transport request failed: {0}")]
    Request(String),

    #[error("Transport not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid contact: {0}")]
    InvalidContact(String),
}

impl TransportError {
    /// Raw provider payload or error text kept on the delivery record
    pub fn provider_payload(&self) -> String {
        match self {
            TransportError::Rejected { payload, .. } => payload.clone(),
            other => other.to_string(),
        }
    }
}

/// Delivery ledger write errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Delivery ledger write failed: {0}")]
    WriteFailed(StorageError),

    #[error("A SENT record already exists for {0}")]
    DuplicateSent(String),
}

/// Validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) if code.as_ref() == "23505" => {
                    DatabaseError::DuplicateKey(db_err.message().to_string())
                }
                _ => DatabaseError::QueryFailed(db_err.message().to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionFailed(err.to_string())
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<DatabaseError> for StorageError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::ConnectionFailed(msg) | DatabaseError::HealthCheckFailed(msg) => {
                StorageError::Unavailable(msg)
            }
            DatabaseError::DuplicateKey(msg) => StorageError::DuplicateKey(msg),
            other => StorageError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_keeps_raw_payload() {
        let err = TransportError::Rejected {
            status: 400,
            payload: r#"{"message":"template not approved"}"#.to_string(),
        };
        assert_eq!(err.provider_payload(), r#"{"message":"template not approved"}"#);
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_timeout_payload_is_message() {
        let err = TransportError::Timeout(15);
        assert!(err.provider_payload().contains("15 seconds"));
    }

    #[test]
    fn test_duplicate_key_maps_to_storage_duplicate() {
        let err: StorageError = DatabaseError::DuplicateKey("delivery_records_sent_key".into()).into();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[test]
    fn test_connection_failure_maps_to_unavailable() {
        let err: StorageError = DatabaseError::ConnectionFailed("refused".into()).into();
        assert_eq!(err, StorageError::Unavailable("refused".into()));
    }

    #[test]
    fn test_resolution_error_from_storage() {
        let err: ResolutionError = StorageError::Unavailable("down".into()).into();
        assert!(err.to_string().contains("down"));
    }
}
