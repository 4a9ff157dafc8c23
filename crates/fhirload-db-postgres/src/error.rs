//! Error types for the PostgreSQL sink.

use fhirload_storage::StorageError;
use sqlx_core::error::Error as SqlxError;
use sqlx_postgres::PgDatabaseError;

/// PostgreSQL error code for undefined table (42P01).
pub const PG_UNDEFINED_TABLE: &str = "42P01";

/// PostgreSQL error code for unique constraint violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Checks if a sqlx error is "undefined table" (42P01).
pub fn is_undefined_table(err: &SqlxError) -> bool {
    has_pg_error_code(err, PG_UNDEFINED_TABLE)
}

/// Checks if a sqlx error is a unique constraint violation (23505).
pub fn is_unique_violation(err: &SqlxError) -> bool {
    has_pg_error_code(err, PG_UNIQUE_VIOLATION)
}

/// Extracts the conflicting key from a unique-violation detail such as
/// `Key (id)=(pt-1) already exists.`
pub fn conflicting_key(detail: &str) -> Option<&str> {
    let start = detail.find(")=(")? + 3;
    let rest = &detail[start..];
    let end = rest.rfind(") already exists").or_else(|| rest.rfind(')'))?;
    Some(&rest[..end])
}

/// Errors specific to the PostgreSQL sink.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Connection(#[from] sqlx_core::error::Error),

    /// Pool error.
    #[error("Pool error: {message}")]
    Pool { message: String },

    /// Table for a resource type does not exist.
    #[error("Table for resource type {resource_type} does not exist")]
    MissingTable { resource_type: String },
}

impl PostgresError {
    /// Creates a new pool error.
    #[must_use]
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    /// Creates a new missing table error.
    #[must_use]
    pub fn missing_table(resource_type: impl Into<String>) -> Self {
        Self::MissingTable {
            resource_type: resource_type.into(),
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(e) => StorageError::connection_error(e.to_string()),
            PostgresError::Pool { message } => {
                StorageError::connection_error(format!("Pool error: {message}"))
            }
            PostgresError::MissingTable { resource_type } => {
                StorageError::missing_table(resource_type)
            }
        }
    }
}

/// Maps a failed write for `resource_type` to a storage error.
///
/// Unique violations become `AlreadyExists` when the server reports the
/// conflicting key, undefined tables become `MissingTable`; anything else
/// raised during COPY is a `CopyFailed`.
pub fn write_error(resource_type: &str, err: SqlxError, during_copy: bool) -> StorageError {
    if is_undefined_table(&err) {
        return StorageError::missing_table(resource_type);
    }

    if is_unique_violation(&err)
        && let SqlxError::Database(db_err) = &err
        && let Some(id) = db_err
            .try_downcast_ref::<PgDatabaseError>()
            .and_then(PgDatabaseError::detail)
            .and_then(conflicting_key)
    {
        return StorageError::already_exists(resource_type, id);
    }

    if during_copy {
        StorageError::copy_failed(resource_type, err.to_string())
    } else {
        PostgresError::from(err).into()
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PostgresError::pool("pool exhausted");
        assert!(err.to_string().contains("Pool error"));
    }

    #[test]
    fn test_conversion_to_storage_error() {
        let storage_err: StorageError = PostgresError::pool("no connections").into();
        assert!(matches!(storage_err, StorageError::ConnectionError { .. }));

        let storage_err: StorageError = PostgresError::missing_table("Patient").into();
        assert!(matches!(storage_err, StorageError::MissingTable { .. }));
    }

    #[test]
    fn test_conflicting_key() {
        assert_eq!(
            conflicting_key("Key (id)=(pt-1) already exists."),
            Some("pt-1")
        );
        assert_eq!(
            conflicting_key("Key (id)=(a(b)c) already exists."),
            Some("a(b)c")
        );
        assert_eq!(conflicting_key("something else"), None);
    }

    #[test]
    fn test_non_database_error_during_copy() {
        let err = write_error("Patient", SqlxError::PoolTimedOut, true);
        assert!(matches!(err, StorageError::CopyFailed { .. }));

        let err = write_error("Patient", SqlxError::PoolTimedOut, false);
        assert!(matches!(err, StorageError::ConnectionError { .. }));
    }
}
