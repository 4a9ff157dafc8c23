//! Sink traits for the ingestion pipeline.
//!
//! A sink exposes exactly the two write paths the loader needs: a per-record
//! insert that keeps the first stored instance, and a bulk-append session
//! for a homogeneous run of records.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::Record;

/// Result of a single-record insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was stored.
    Written,
    /// A record with the same type and ID was already stored; nothing changed.
    Conflict,
}

/// Destination for loaded records.
///
/// Implementations must be thread-safe (`Send + Sync`), though the loader
/// itself only ever issues one call at a time.
#[async_trait]
pub trait ResourceSink: Send + Sync {
    /// Stores one record unless its `(type, id)` already exists.
    ///
    /// Records without an ID get one assigned and never conflict.
    ///
    /// # Errors
    ///
    /// Returns an error for infrastructure problems or a missing table.
    /// A duplicate identifier is reported as [`InsertOutcome::Conflict`],
    /// never as an error.
    async fn insert_one(&self, record: &Record) -> Result<InsertOutcome, StorageError>;

    /// Opens a bulk-append session for records of a single resource type.
    ///
    /// Everything appended to the session is written by one bulk operation
    /// when [`CopySession::finish`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start the bulk operation.
    async fn begin_copy(&self, resource_type: &str) -> Result<Box<dyn CopySession>, StorageError>;

    /// Returns the name of this backend for logging.
    fn backend_name(&self) -> &'static str;
}

/// An open bulk-append operation for one resource type.
///
/// Sessions are consumed by either `finish` or `abort`. Dropping a session
/// without calling either discards whatever was appended.
#[async_trait]
pub trait CopySession: Send {
    /// The resource type this session accepts.
    fn resource_type(&self) -> &str;

    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if the record has another
    /// type, or a backend error if streaming fails.
    async fn append(&mut self, record: &Record) -> Result<(), StorageError>;

    /// Completes the bulk operation and returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Duplicate identifiers fail the whole session
    /// (`StorageError::AlreadyExists` or `StorageError::CopyFailed`).
    async fn finish(self: Box<Self>) -> Result<u64, StorageError>;

    /// Abandons the bulk operation; nothing appended so far is kept.
    async fn abort(self: Box<Self>, reason: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test that ResourceSink is object-safe
    fn _assert_sink_object_safe(_: &dyn ResourceSink) {}

    // Compile-time test that CopySession is object-safe
    fn _assert_session_object_safe(_: &dyn CopySession) {}
}
