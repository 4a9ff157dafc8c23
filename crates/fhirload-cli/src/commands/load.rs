use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use fhirload_db_memory::MemorySink;
use fhirload_db_postgres::PostgresSink;
use fhirload_ingest::{Loader, SourceResolver};
use fhirload_storage::DynSink;
use tracing::info;

use crate::cli::LoadArgs;
use crate::config::LoaderConfig;
use crate::output::{print_download_summary, print_load_summary, print_success};

pub async fn run(cfg: &LoaderConfig, args: &LoadArgs) -> Result<()> {
    let resolver =
        SourceResolver::new(cfg.resolve_options()).context("Failed to create HTTP client")?;
    // Holds the scratch download directory until loading finishes.
    let resolution = resolver
        .resolve(&args.inputs)
        .await
        .context("Failed to resolve inputs")?;
    if let Some(report) = &resolution.download {
        print_download_summary(report);
    }

    let sink: DynSink = if args.dry_run {
        info!("Dry run, resources are kept in memory only");
        Arc::new(MemorySink::new())
    } else {
        let pg = cfg.postgres.sink_config().map_err(|e| anyhow!(e))?;
        info!(url = %cfg.postgres.redacted_url(), "Connecting to PostgreSQL");
        let sink = PostgresSink::new(pg)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Arc::new(sink)
    };

    let options = cfg.load.options(resolution.from_bulk_endpoint());
    let loader = Loader::new(sink, options);

    match loader.run(&resolution.sources).await {
        Ok(report) => {
            print_load_summary(&report);
            print_success(&format!(
                "Loaded {} resource(s) from {} source(s)",
                report.written(),
                report.sources.len()
            ));
            Ok(())
        }
        Err(err) => {
            print_load_summary(err.report());
            Err(err).context("Load failed")
        }
    }
}
