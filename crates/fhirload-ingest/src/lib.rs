//! # fhirload-ingest
//!
//! The ingestion pipeline: resolve inputs to sources, download Bulk Data
//! exports, detect each source's compression and shape, decode records
//! incrementally, and write them to a [`fhirload_storage::ResourceSink`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fhirload_db_memory::MemorySink;
//! use fhirload_ingest::{LoadOptions, Loader, ResolveOptions, SourceResolver};
//!
//! let resolver = SourceResolver::new(ResolveOptions::default())?;
//! let resolution = resolver.resolve(&["patients.ndjson.gz".to_string()]).await?;
//!
//! let loader = Loader::new(Arc::new(MemorySink::new()), LoadOptions::default());
//! let report = loader.run(&resolution.sources).await?;
//! println!("{} written, {} conflicts", report.written(), report.conflicts());
//! ```

pub mod bulk;
pub mod decode;
pub mod error;
pub mod format;
pub mod loader;
pub mod memusage;
pub mod resolve;

pub use bulk::{BulkDownloader, BulkOptions, DownloadReport, Manifest, ManifestClient};
pub use decode::{RecordStream, Source, SourceOrigin};
pub use error::{
    BulkError, DecodeError, DecodeErrorKind, FormatError, LoadError, LoadErrorKind, ResolveError,
};
pub use format::{Compression, Format, SNIFF_WINDOW, Shape};
pub use loader::{
    DecodePolicy, LoadMode, LoadOptions, LoadReport, Loader, SourceReport, TypeCounts,
    UnrecognizedPolicy,
};
pub use memusage::MemoryReporter;
pub use resolve::{Resolution, ResolveOptions, SourceResolver};
