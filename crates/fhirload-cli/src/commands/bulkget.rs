use anyhow::{Context, Result};
use fhirload_ingest::resolve::as_endpoint;
use fhirload_ingest::{BulkDownloader, ManifestClient};
use tracing::info;

use crate::cli::BulkgetArgs;
use crate::config::LoaderConfig;
use crate::output::{print_download_summary, print_success};

pub async fn run(cfg: &LoaderConfig, args: &BulkgetArgs) -> Result<()> {
    let endpoint = as_endpoint(&args.url)
        .with_context(|| format!("Not an http(s) URL: {}", args.url))?;

    let options = cfg.bulk.options();
    let http = options.client()?;

    let manifest = ManifestClient::new(http.clone(), &options)
        .fetch(&endpoint)
        .await
        .context("Failed to fetch export manifest")?;
    info!(
        files = manifest.output.len(),
        transaction_time = manifest.transaction_time.as_deref().unwrap_or("-"),
        "Export manifest received"
    );

    let report = BulkDownloader::new(http, &options)
        .download(&manifest, &args.target_dir)
        .await?;
    print_download_summary(&report);

    let done = report.into_result()?;
    print_success(&format!(
        "{} file(s) written to {}",
        done.len(),
        args.target_dir.display()
    ));
    Ok(())
}
