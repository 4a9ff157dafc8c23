//! Sink error types shared by every storage backend.

/// Errors that can occur while writing records to a sink.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A record with the same type and ID is already stored.
    ///
    /// Insert mode never surfaces this (conflicts are an outcome there);
    /// bulk copies fail with it because the destination has no merge policy.
    #[error("Resource already exists: {resource_type}/{id}")]
    AlreadyExists {
        /// The type of the conflicting resource.
        resource_type: String,
        /// The conflicting ID.
        id: String,
    },

    /// The record cannot be stored as-is.
    #[error("Invalid resource: {message}")]
    InvalidResource {
        /// Description of why the resource is invalid.
        message: String,
    },

    /// The destination has no table for this resource type.
    #[error("No table for resource type {resource_type}; initialize the schema first")]
    MissingTable {
        /// The resource type without a table.
        resource_type: String,
    },

    /// A bulk copy was rejected or interrupted by the backend.
    #[error("Bulk copy of {resource_type} failed: {message}")]
    CopyFailed {
        /// The type being copied.
        resource_type: String,
        /// Backend error description.
        message: String,
    },

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a new `InvalidResource` error.
    #[must_use]
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    /// Creates a new `MissingTable` error.
    #[must_use]
    pub fn missing_table(resource_type: impl Into<String>) -> Self {
        Self::MissingTable {
            resource_type: resource_type.into(),
        }
    }

    /// Creates a new `CopyFailed` error.
    #[must_use]
    pub fn copy_failed(resource_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CopyFailed {
            resource_type: resource_type.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::already_exists("Patient", "456");
        assert_eq!(err.to_string(), "Resource already exists: Patient/456");

        let err = StorageError::missing_table("Observation");
        assert_eq!(
            err.to_string(),
            "No table for resource type Observation; initialize the schema first"
        );
    }
}
