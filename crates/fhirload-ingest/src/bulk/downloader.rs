//! Bounded-concurrency download of manifest files.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use futures_util::stream::{FuturesUnordered, StreamExt};
use reqwest::header::ACCEPT;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::{BulkOptions, Manifest};
use crate::error::BulkError;

/// Lifecycle of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Active,
    Done,
    Failed,
}

/// Why one download failed.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("server returned {status}")]
    Status { status: u16 },

    #[error("transfer failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("cannot write file: {0}")]
    Io(#[from] io::Error),
}

/// One manifest entry and what became of it.
#[derive(Debug)]
pub struct DownloadTask {
    pub index: usize,
    pub resource_type: String,
    pub url: String,
    /// Final path of the file; only exists once `status` is `Done`.
    pub destination: PathBuf,
    pub status: TaskStatus,
    pub bytes: u64,
    pub error: Option<DownloadError>,
}

/// A failed task, as aggregated into `BulkError::Downloads`.
#[derive(Debug)]
pub struct DownloadFailure {
    pub index: usize,
    pub resource_type: String,
    pub url: String,
    pub error: DownloadError,
}

impl std::fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} ({}): {}",
            self.index, self.resource_type, self.url, self.error
        )
    }
}

/// Outcome of downloading every file of a manifest, in manifest order.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub tasks: Vec<DownloadTask>,
    /// Largest number of downloads observed in flight at once.
    pub peak_active: usize,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Done)
    }

    pub fn failed(&self) -> impl Iterator<Item = &DownloadTask> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }

    /// Completed downloads in manifest order.
    pub fn completed(&self) -> impl Iterator<Item = &DownloadTask> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Done)
    }

    pub fn total_bytes(&self) -> u64 {
        self.completed().map(|t| t.bytes).sum()
    }

    /// Splits the report into completed tasks and failures.
    pub fn partition(self) -> (Vec<DownloadTask>, Vec<DownloadFailure>) {
        let mut done = Vec::new();
        let mut failures = Vec::new();
        for task in self.tasks {
            match (task.status, task.error) {
                (TaskStatus::Done, _) => done.push(DownloadTask { error: None, ..task }),
                (_, error) => failures.push(DownloadFailure {
                    index: task.index,
                    resource_type: task.resource_type,
                    url: task.url,
                    error: error.unwrap_or(DownloadError::Status { status: 0 }),
                }),
            }
        }
        (done, failures)
    }

    /// Returns the completed tasks, or every failure if any task failed.
    ///
    /// # Errors
    ///
    /// Returns `BulkError::Downloads` listing all failed tasks.
    pub fn into_result(self) -> Result<Vec<DownloadTask>, BulkError> {
        let total = self.tasks.len();
        let (done, failures) = self.partition();
        if failures.is_empty() {
            Ok(done)
        } else {
            Err(BulkError::Downloads { total, failures })
        }
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = (usize, Result<u64, DownloadError>)> + Send>>;

/// Downloads manifest files with at most `concurrency` requests in flight.
#[derive(Debug, Clone)]
pub struct BulkDownloader {
    http: reqwest::Client,
    concurrency: usize,
    accept: String,
}

impl BulkDownloader {
    pub fn new(http: reqwest::Client, options: &BulkOptions) -> Self {
        Self {
            http,
            concurrency: options.concurrency.max(1),
            accept: options.accept.clone(),
        }
    }

    /// File name for the entry at `index`: `<NNNN>-<Type>.ndjson`.
    pub fn file_name(index: usize, resource_type: &str) -> String {
        let safe: String = resource_type
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        format!("{index:04}-{safe}.ndjson")
    }

    /// Downloads every `output` entry of `manifest` into `target_dir`.
    ///
    /// A new download starts as soon as one finishes. Failures do not stop
    /// the other downloads; every task is terminal when this returns.
    ///
    /// # Errors
    ///
    /// Returns `BulkError::Io` only if `target_dir` cannot be created.
    /// Per-file failures are reported in the [`DownloadReport`].
    #[instrument(skip(self, manifest), fields(files = manifest.output.len(), concurrency = self.concurrency))]
    pub async fn download(
        &self,
        manifest: &Manifest,
        target_dir: &Path,
    ) -> Result<DownloadReport, BulkError> {
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| BulkError::Io {
                path: target_dir.to_path_buf(),
                source,
            })?;

        let mut tasks: Vec<DownloadTask> = manifest
            .output
            .iter()
            .enumerate()
            .map(|(index, entry)| DownloadTask {
                index,
                resource_type: entry.resource_type.clone(),
                url: entry.url.clone(),
                destination: target_dir.join(Self::file_name(index, &entry.resource_type)),
                status: TaskStatus::Pending,
                bytes: 0,
                error: None,
            })
            .collect();

        let mut in_flight: FuturesUnordered<TaskFuture> = FuturesUnordered::new();
        let mut next = 0;
        let mut peak_active = 0;

        loop {
            while in_flight.len() < self.concurrency && next < tasks.len() {
                let task = &mut tasks[next];
                task.status = TaskStatus::Active;
                debug!(index = task.index, url = %task.url, "Download started");
                in_flight.push(Box::pin(fetch_file(
                    self.http.clone(),
                    self.accept.clone(),
                    task.index,
                    task.url.clone(),
                    task.destination.clone(),
                )));
                next += 1;
            }
            peak_active = peak_active.max(in_flight.len());

            let Some((index, result)) = in_flight.next().await else {
                break;
            };

            let task = &mut tasks[index];
            match result {
                Ok(bytes) => {
                    debug!(index, bytes, path = %task.destination.display(), "Download finished");
                    task.status = TaskStatus::Done;
                    task.bytes = bytes;
                }
                Err(error) => {
                    warn!(index, url = %task.url, error = %error, "Download failed");
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                }
            }
        }

        let report = DownloadReport { tasks, peak_active };
        info!(
            succeeded = report.completed().count(),
            failed = report.failed().count(),
            bytes = report.total_bytes(),
            peak_active,
            "Downloads finished"
        );
        Ok(report)
    }
}

async fn fetch_file(
    http: reqwest::Client,
    accept: String,
    index: usize,
    url: String,
    destination: PathBuf,
) -> (usize, Result<u64, DownloadError>) {
    let mut partial = destination.clone().into_os_string();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let result = stream_to_file(&http, &accept, &url, &partial).await;
    let result = match result {
        Ok(bytes) => tokio::fs::rename(&partial, &destination)
            .await
            .map(|()| bytes)
            .map_err(DownloadError::from),
        Err(err) => Err(err),
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    (index, result)
}

async fn stream_to_file(
    http: &reqwest::Client,
    accept: &str,
    url: &str,
    path: &Path,
) -> Result<u64, DownloadError> {
    let mut response = http.get(url).header(ACCEPT, accept).send().await?;
    if !response.status().is_success() {
        return Err(DownloadError::Status {
            status: response.status().as_u16(),
        });
    }

    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        assert_eq!(BulkDownloader::file_name(3, "Patient"), "0003-Patient.ndjson");
        assert_eq!(
            BulkDownloader::file_name(12345, "../Obs"),
            "12345-Obs.ndjson"
        );
    }

    #[test]
    fn test_empty_report_is_success() {
        let report = DownloadReport::default();
        assert!(report.is_success());
        assert!(report.into_result().unwrap().is_empty());
    }

    #[test]
    fn test_into_result_collects_failures() {
        let task = |index, status, error| DownloadTask {
            index,
            resource_type: "Patient".into(),
            url: format!("http://example.org/{index}"),
            destination: PathBuf::from(format!("/tmp/{index}")),
            status,
            bytes: 0,
            error,
        };
        let report = DownloadReport {
            tasks: vec![
                task(0, TaskStatus::Done, None),
                task(1, TaskStatus::Failed, Some(DownloadError::Status { status: 404 })),
                task(2, TaskStatus::Failed, Some(DownloadError::Status { status: 500 })),
            ],
            peak_active: 2,
        };

        match report.into_result() {
            Err(BulkError::Downloads { total, failures }) => {
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].index, 1);
                assert_eq!(failures[1].to_string(), "#2 Patient (http://example.org/2): server returned 500");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
