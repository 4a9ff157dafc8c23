//! Bulk Data export client: kick-off, status polling and file download.

mod downloader;
mod manifest;

use std::time::Duration;

pub use downloader::{
    BulkDownloader, DownloadError, DownloadFailure, DownloadReport, DownloadTask, TaskStatus,
};
pub use manifest::{Manifest, ManifestClient, ManifestEntry};

use crate::error::BulkError;

/// Default `Accept` header for kick-off, status and file requests.
pub const DEFAULT_ACCEPT: &str = "application/fhir+json";

/// Default number of concurrent file downloads.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Settings shared by the manifest client and the downloader.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Maximum number of files downloaded at once.
    pub concurrency: usize,
    /// `Accept` header value.
    pub accept: String,
    /// Wait between status polls when the server sends no `Retry-After`.
    pub poll_interval: Duration,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            accept: DEFAULT_ACCEPT.to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl BulkOptions {
    /// Builds the HTTP client used for all Bulk Data requests.
    ///
    /// # Errors
    ///
    /// Returns `BulkError::Http` if the TLS backend cannot be initialized.
    pub fn client(&self) -> Result<reqwest::Client, BulkError> {
        reqwest::Client::builder()
            .user_agent(concat!("fhirload/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BulkError::http("client", e))
    }
}
