//! In-memory sink backend for fhirload.
//!
//! This crate provides an in-memory implementation of the `ResourceSink`
//! trait from `fhirload-storage`, using a `DashMap` keyed by
//! `ResourceType/id`. It is used for dry runs and by the pipeline tests,
//! which inspect the logged copy sessions to verify batching.
//!
//! # Example
//!
//! ```ignore
//! use fhirload_db_memory::MemorySink;
//! use fhirload_storage::{Record, ResourceSink};
//!
//! let sink = MemorySink::new();
//! let patient = Record::from_value(serde_json::json!({
//!     "resourceType": "Patient",
//!     "id": "example"
//! }))?;
//! sink.insert_one(&patient).await?;
//! assert_eq!(sink.count_by_type("Patient"), 1);
//! ```

mod sink;

pub use fhirload_storage::{ResourceSink, StorageError};
pub use sink::{CopyCall, MemorySink, StorageKey};

