//! # fhirload-storage
//!
//! Sink abstraction layer for the fhirload ingestion pipeline.
//!
//! This crate defines the record type flowing through the pipeline and the
//! traits every destination must implement. Implementations live in
//! separate crates (`fhirload-db-postgres`, `fhirload-db-memory`).
//!
//! ## Example
//!
//! ```ignore
//! use fhirload_storage::{InsertOutcome, Record, ResourceSink, StorageError};
//!
//! async fn store(sink: &dyn ResourceSink, doc: serde_json::Value) -> Result<bool, StorageError> {
//!     let record = Record::from_value(doc)
//!         .map_err(|e| StorageError::invalid_resource(e.to_string()))?;
//!     Ok(sink.insert_one(&record).await? == InsertOutcome::Written)
//! }
//! ```

mod error;
mod record;
mod traits;

pub use error::StorageError;
pub use record::{Record, RecordError};
pub use traits::{CopySession, InsertOutcome, ResourceSink};

/// Type alias for a shareable sink trait object.
pub type DynSink = std::sync::Arc<dyn ResourceSink>;
