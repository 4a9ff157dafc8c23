//! Expansion of command-line inputs into an ordered list of sources.

use std::path::PathBuf;

use tempfile::TempDir;
use tracing::{info, warn};
use url::Url;

use crate::bulk::{BulkDownloader, BulkOptions, DownloadReport, ManifestClient};
use crate::decode::Source;
use crate::error::{BulkError, ResolveError};

/// How remote endpoints are fetched.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub bulk: BulkOptions,
    /// Where downloaded files go; a temporary directory when unset.
    pub download_dir: Option<PathBuf>,
    /// Use the files that did download when some downloads fail.
    pub allow_partial_download: bool,
}

/// The sources to load, in order.
#[derive(Debug)]
pub struct Resolution {
    pub sources: Vec<Source>,
    /// Download outcome when a Bulk Data endpoint was among the inputs.
    pub download: Option<DownloadReport>,
    /// Directory holding the downloaded files.
    pub download_dir: Option<PathBuf>,
    /// Keeps a temporary download directory alive until the load is done.
    _scratch: Option<TempDir>,
}

impl Resolution {
    /// Whether any source was downloaded from a Bulk Data endpoint.
    pub fn from_bulk_endpoint(&self) -> bool {
        self.download.is_some()
    }
}

/// Returns the argument as a Bulk Data endpoint if it is an HTTP(S) URL.
pub fn as_endpoint(arg: &str) -> Option<Url> {
    Url::parse(arg)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Turns positional inputs into sources.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    http: reqwest::Client,
    options: ResolveOptions,
}

impl SourceResolver {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(options: ResolveOptions) -> Result<Self, BulkError> {
        let http = options.bulk.client()?;
        Ok(Self { http, options })
    }

    pub fn with_client(http: reqwest::Client, options: ResolveOptions) -> Self {
        Self { http, options }
    }

    /// Resolves `args` in order.
    ///
    /// Local paths are checked for existence. A single HTTP(S) argument is
    /// treated as a Bulk Data endpoint: its export is fully downloaded
    /// before this returns, and the downloaded files take the argument's
    /// place in manifest order.
    ///
    /// # Errors
    ///
    /// Fails on empty input, a missing file, more than one endpoint, or a
    /// failed export. Failed downloads are fatal unless partial downloads
    /// are allowed.
    pub async fn resolve(&self, args: &[String]) -> Result<Resolution, ResolveError> {
        if args.is_empty() {
            return Err(ResolveError::NoInputs);
        }

        let mut endpoint: Option<(usize, Url)> = None;
        for (position, arg) in args.iter().enumerate() {
            match (as_endpoint(arg), &endpoint) {
                (Some(_), Some((first, _))) => {
                    return Err(ResolveError::MultipleEndpoints {
                        first: args[*first].clone(),
                        second: arg.clone(),
                    });
                }
                (Some(url), None) => endpoint = Some((position, url)),
                (None, _) => {
                    let path = PathBuf::from(arg);
                    if !path.is_file() {
                        return Err(ResolveError::MissingFile { path });
                    }
                }
            }
        }

        let Some((position, url)) = endpoint else {
            return Ok(Resolution {
                sources: args.iter().map(Source::local).collect(),
                download: None,
                download_dir: None,
                _scratch: None,
            });
        };

        let (target, scratch) = match &self.options.download_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("fhirload-")
                    .tempdir()
                    .map_err(ResolveError::Scratch)?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let manifest = ManifestClient::new(self.http.clone(), &self.options.bulk)
            .fetch(&url)
            .await?;
        let report = BulkDownloader::new(self.http.clone(), &self.options.bulk)
            .download(&manifest, &target)
            .await?;

        for task in report.failed() {
            if let Some(error) = &task.error {
                warn!(index = task.index, url = %task.url, error = %error, "File not downloaded");
            }
        }
        if !report.is_success() && !self.options.allow_partial_download {
            let total = report.tasks.len();
            let (_, failures) = report.partition();
            return Err(BulkError::Downloads { total, failures }.into());
        }

        let downloaded: Vec<Source> = report
            .completed()
            .map(|task| Source::downloaded(&task.destination, &task.resource_type, &task.url))
            .collect();
        info!(
            endpoint = %url,
            files = downloaded.len(),
            dir = %target.display(),
            "Bulk export downloaded"
        );

        let mut sources = Vec::with_capacity(args.len() - 1 + downloaded.len());
        sources.extend(args[..position].iter().map(Source::local));
        sources.extend(downloaded);
        sources.extend(args[position + 1..].iter().map(Source::local));

        Ok(Resolution {
            sources,
            download: Some(report),
            download_dir: Some(target),
            _scratch: scratch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_endpoint() {
        assert!(as_endpoint("http://example.org/fhir/$export").is_some());
        assert!(as_endpoint("https://example.org/fhir/Patient/$export").is_some());
        assert!(as_endpoint("ftp://example.org/file").is_none());
        assert!(as_endpoint("data/patients.ndjson").is_none());
        assert!(as_endpoint("/abs/path.json").is_none());
    }

    #[tokio::test]
    async fn test_local_files_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ndjson");
        let b = dir.path().join("b.json");
        std::fs::write(&a, "{}").unwrap();
        std::fs::write(&b, "{}").unwrap();

        let resolver = SourceResolver::new(ResolveOptions::default()).unwrap();
        let args = vec![
            b.display().to_string(),
            a.display().to_string(),
        ];
        let resolution = resolver.resolve(&args).await.unwrap();

        assert!(!resolution.from_bulk_endpoint());
        let paths: Vec<_> = resolution.sources.iter().map(|s| s.path.clone()).collect();
        assert_eq!(paths, vec![b, a]);
    }

    #[tokio::test]
    async fn test_missing_file_fails_fast() {
        let resolver = SourceResolver::new(ResolveOptions::default()).unwrap();
        let err = resolver
            .resolve(&["/no/such/file.ndjson".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingFile { .. }));
    }

    #[tokio::test]
    async fn test_two_endpoints_rejected() {
        let resolver = SourceResolver::new(ResolveOptions::default()).unwrap();
        let args = vec![
            "http://one.example/$export".to_string(),
            "http://two.example/$export".to_string(),
        ];
        let err = resolver.resolve(&args).await.unwrap_err();
        assert!(matches!(err, ResolveError::MultipleEndpoints { .. }));
    }

    #[tokio::test]
    async fn test_no_inputs() {
        let resolver = SourceResolver::new(ResolveOptions::default()).unwrap();
        assert!(matches!(
            resolver.resolve(&[]).await.unwrap_err(),
            ResolveError::NoInputs
        ));
    }
}
