//! Kick-off and status polling for the Bulk Data `$export` operation.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_LOCATION, HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use super::BulkOptions;
use crate::error::BulkError;

/// One file listed by a completed export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// The completion document of a Bulk Data export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub transaction_time: Option<String>,
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub output: Vec<ManifestEntry>,
    #[serde(default)]
    pub error: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parses a manifest body.
    ///
    /// # Errors
    ///
    /// Returns `BulkError::Manifest` if the body is not a manifest.
    pub fn parse(url: &str, body: &[u8]) -> Result<Self, BulkError> {
        serde_json::from_slice(body).map_err(|source| BulkError::Manifest {
            url: url.to_string(),
            source,
        })
    }
}

/// Runs the asynchronous request pattern against a Bulk Data endpoint.
#[derive(Debug, Clone)]
pub struct ManifestClient {
    http: reqwest::Client,
    accept: String,
    poll_interval: Duration,
}

enum Poll {
    Ready(Manifest),
    Pending(Option<Duration>),
}

impl ManifestClient {
    pub fn new(http: reqwest::Client, options: &BulkOptions) -> Self {
        Self {
            http,
            accept: options.accept.clone(),
            poll_interval: options.poll_interval,
        }
    }

    /// Starts an export at `endpoint` and waits for its manifest.
    ///
    /// A `200` kick-off response is taken as the manifest itself. A `202`
    /// response names the status URL in `Content-Location`, which is polled
    /// until it answers `200`.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures, unexpected status codes and
    /// unparseable manifests. Nothing is retried.
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn fetch(&self, endpoint: &Url) -> Result<Manifest, BulkError> {
        info!("Starting bulk export");
        let response = self
            .http
            .get(endpoint.clone())
            .header(ACCEPT, &self.accept)
            .header("Prefer", "respond-async")
            .send()
            .await
            .map_err(|e| BulkError::http(endpoint.as_str(), e))?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| BulkError::http(endpoint.as_str(), e))?;
                Manifest::parse(endpoint.as_str(), &body)
            }
            StatusCode::ACCEPTED => {
                let location = status_location(endpoint, response.headers())?;
                debug!(status_url = %location, "Export accepted, polling status");
                self.wait(&location).await
            }
            _ => Err(BulkError::Kickoff {
                url: endpoint.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn wait(&self, status_url: &Url) -> Result<Manifest, BulkError> {
        let mut polls = 0u32;
        loop {
            polls += 1;
            match self.poll(status_url).await? {
                Poll::Ready(manifest) => {
                    info!(
                        polls,
                        files = manifest.output.len(),
                        errors = manifest.error.len(),
                        "Bulk export complete"
                    );
                    return Ok(manifest);
                }
                Poll::Pending(retry_after) => {
                    let delay = retry_after.unwrap_or(self.poll_interval);
                    debug!(polls, delay_ms = delay.as_millis() as u64, "Export in progress");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn poll(&self, status_url: &Url) -> Result<Poll, BulkError> {
        let response = self
            .http
            .get(status_url.clone())
            .header(ACCEPT, &self.accept)
            .send()
            .await
            .map_err(|e| BulkError::http(status_url.as_str(), e))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| BulkError::http(status_url.as_str(), e))?;
                Manifest::parse(status_url.as_str(), &body).map(Poll::Ready)
            }
            StatusCode::ACCEPTED => Ok(Poll::Pending(retry_after(response.headers()))),
            status => Err(BulkError::Status {
                url: status_url.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Resolves `Content-Location` against the kick-off URL.
fn status_location(endpoint: &Url, headers: &HeaderMap) -> Result<Url, BulkError> {
    let location = headers
        .get(CONTENT_LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| BulkError::MissingStatusLocation {
            url: endpoint.to_string(),
        })?;

    endpoint
        .join(location)
        .map_err(|e| BulkError::invalid_url(location, e))
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_manifest() {
        let body = br#"{
            "transactionTime": "2024-01-01T00:00:00Z",
            "request": "http://example.org/fhir/$export",
            "requiresAccessToken": false,
            "output": [
                {"type": "Patient", "url": "http://example.org/files/1.ndjson", "count": 10},
                {"type": "Observation", "url": "http://example.org/files/2.ndjson"}
            ],
            "error": []
        }"#;
        let manifest = Manifest::parse("http://example.org", body).unwrap();

        assert_eq!(manifest.output.len(), 2);
        assert_eq!(manifest.output[0].resource_type, "Patient");
        assert_eq!(manifest.output[0].count, Some(10));
        assert_eq!(manifest.output[1].count, None);
        assert_eq!(
            manifest.transaction_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_parse_manifest_rejects_garbage() {
        let err = Manifest::parse("http://example.org", b"<html>").unwrap_err();
        assert!(matches!(err, BulkError::Manifest { .. }));
    }

    #[test]
    fn test_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_relative_status_location() {
        let endpoint = Url::parse("http://example.org/fhir/$export").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LOCATION, HeaderValue::from_static("/status/42"));

        let url = status_location(&endpoint, &headers).unwrap();
        assert_eq!(url.as_str(), "http://example.org/status/42");

        let err = status_location(&endpoint, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, BulkError::MissingStatusLocation { .. }));
    }
}
