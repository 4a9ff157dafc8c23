//! Error types for the ingestion pipeline.

use std::io;
use std::path::PathBuf;

use fhirload_storage::{RecordError, StorageError};

use crate::bulk::DownloadFailure;
use crate::loader::LoadReport;

/// A source whose content could not be opened or classified.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unrecognized format: {reason}")]
    Unrecognized { reason: String },
}

impl FormatError {
    #[must_use]
    pub fn unrecognized(reason: impl Into<String>) -> Self {
        Self::Unrecognized {
            reason: reason.into(),
        }
    }

    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::Unrecognized { .. })
    }
}

/// What went wrong while decoding one unit of a source.
#[derive(Debug, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid resource: {0}")]
    Record(#[from] RecordError),

    #[error("malformed document: {message}")]
    Syntax { message: String },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected data after the resource")]
    TrailingData,
}

/// A unit (line, bundle entry, or whole document) that failed to decode.
///
/// `unit` is the 1-based line number for NDJSON, the 1-based entry ordinal
/// for bundles and `1` for single documents. `offset` is the byte position
/// in the decompressed stream where the unit started.
#[derive(Debug, thiserror::Error)]
#[error("unit {unit} at byte {offset}: {kind}")]
pub struct DecodeError {
    pub unit: u64,
    pub offset: u64,
    #[source]
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    #[must_use]
    pub fn new(unit: u64, offset: u64, kind: impl Into<DecodeErrorKind>) -> Self {
        Self {
            unit,
            offset,
            kind: kind.into(),
        }
    }

    /// Whether the stream ended with this error. Read failures and
    /// structural damage leave nothing decodable behind the failing unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            DecodeErrorKind::Io(_) | DecodeErrorKind::Syntax { .. } | DecodeErrorKind::UnexpectedEof
        )
    }
}

/// Errors raised by the Bulk Data client and downloader.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("bulk export kick-off at {url} returned {status}: {body}")]
    Kickoff {
        url: String,
        status: u16,
        body: String,
    },

    #[error("bulk export status at {url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("bulk export kick-off at {url} returned 202 without a Content-Location header")]
    MissingStatusLocation { url: String },

    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("invalid manifest from {url}: {source}")]
    Manifest {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot prepare download directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{count} of {total} downloads failed", count = .failures.len())]
    Downloads {
        total: usize,
        failures: Vec<DownloadFailure>,
    },
}

impl BulkError {
    #[must_use]
    pub fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }

    #[must_use]
    pub fn invalid_url(url: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

/// Errors raised while turning arguments into sources.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no input files or Bulk Data endpoint given")]
    NoInputs,

    #[error("only one Bulk Data endpoint is supported, got {first} and {second}")]
    MultipleEndpoints { first: String, second: String },

    #[error("input file {path} does not exist")]
    MissingFile { path: PathBuf },

    #[error("cannot create download directory: {0}")]
    Scratch(#[source] io::Error),

    #[error(transparent)]
    Bulk(#[from] BulkError),
}

/// Why a load stopped.
#[derive(Debug, thiserror::Error)]
pub enum LoadErrorKind {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A failed load, with the progress made before the failure.
///
/// Batches flushed before the error stay written; `report` accounts for
/// them.
#[derive(Debug, thiserror::Error)]
#[error("{location}: {kind}", location = location(.source_path, .unit))]
pub struct LoadError {
    pub source_path: Option<PathBuf>,
    pub unit: Option<u64>,
    #[source]
    pub kind: LoadErrorKind,
    pub report: Box<LoadReport>,
}

fn location(source_path: &Option<PathBuf>, unit: &Option<u64>) -> String {
    let mut location = match source_path {
        Some(path) => path.display().to_string(),
        None => "load".to_string(),
    };
    if let Some(unit) = unit {
        location.push_str(&format!(" (unit {unit})"));
    }
    location
}

impl LoadError {
    /// The progress recorded before the failure.
    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.kind, LoadErrorKind::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::new(3, 120, DecodeErrorKind::TrailingData);
        assert_eq!(
            err.to_string(),
            "unit 3 at byte 120: unexpected data after the resource"
        );
    }

    #[test]
    fn test_format_error_predicate() {
        assert!(FormatError::unrecognized("empty input").is_unrecognized());
        assert!(!FormatError::from(io::Error::other("boom")).is_unrecognized());
    }

    #[test]
    fn test_load_error_display() {
        let err = LoadError {
            source_path: Some(PathBuf::from("data/patients.ndjson")),
            unit: Some(7),
            kind: LoadErrorKind::Storage(StorageError::already_exists("Patient", "p1")),
            report: Box::default(),
        };
        let message = err.to_string();
        assert!(message.starts_with("data/patients.ndjson (unit 7): "));
        assert!(err.is_storage());
    }
}
