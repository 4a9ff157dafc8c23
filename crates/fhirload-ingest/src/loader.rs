//! Single-pass loading of sources into a sink.
//!
//! The loader reads records in source order and groups maximal runs of the
//! same resource type into batches. Runs continue across source boundaries.
//! In insert mode each record is written on its own; in copy mode each
//! batch becomes exactly one bulk-append session.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use fhirload_storage::{CopySession, DynSink, InsertOutcome, Record, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decode::{RecordStream, Source};
use crate::error::{LoadError, LoadErrorKind};
use crate::format::Format;
use crate::memusage::MemoryReporter;

/// Write strategy, fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// One insert per record; duplicates are skipped and counted.
    #[default]
    Insert,
    /// One bulk copy per batch; duplicates fail the load.
    Copy,
}

impl LoadMode {
    /// Copy for Bulk Data exports (typed, unique files), insert otherwise.
    pub fn default_for(from_bulk_endpoint: bool) -> Self {
        if from_bulk_endpoint {
            Self::Copy
        } else {
            Self::Insert
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "copy" => Ok(Self::Copy),
            other => Err(format!("unknown load mode '{other}', expected insert or copy")),
        }
    }
}

/// What to do with a source whose format cannot be detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnrecognizedPolicy {
    #[default]
    Abort,
    SkipSource,
}

/// What to do with a unit that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodePolicy {
    #[default]
    Abort,
    SkipUnit,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub mode: LoadMode,
    pub on_unrecognized: UnrecognizedPolicy,
    pub on_decode_error: DecodePolicy,
    /// Log process memory after each source.
    pub memory_usage: bool,
}

/// Per-type totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub written: u64,
    pub conflicts: u64,
    pub batches: u64,
}

/// What happened to one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub path: PathBuf,
    pub format: Option<Format>,
    pub records: u64,
    pub skipped_units: u64,
    /// Bundle entries without a resource.
    pub skipped_entries: u64,
    /// Set when the whole source was skipped.
    pub skipped: Option<String>,
}

impl SourceReport {
    fn new(path: PathBuf, format: Option<Format>) -> Self {
        Self {
            path,
            format,
            records: 0,
            skipped_units: 0,
            skipped_entries: 0,
            skipped: None,
        }
    }
}

/// Totals of one loader run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub mode: LoadMode,
    pub sources: Vec<SourceReport>,
    pub types: BTreeMap<String, TypeCounts>,
    pub batches: u64,
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn written(&self) -> u64 {
        self.types.values().map(|c| c.written).sum()
    }

    pub fn conflicts(&self) -> u64 {
        self.types.values().map(|c| c.conflicts).sum()
    }

    pub fn records(&self) -> u64 {
        self.sources.iter().map(|s| s.records).sum()
    }

    pub fn skipped_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.skipped.is_some()).count()
    }

    pub fn skipped_units(&self) -> u64 {
        self.sources.iter().map(|s| s.skipped_units).sum()
    }

    fn counts(&mut self, resource_type: &str) -> &mut TypeCounts {
        self.types.entry(resource_type.to_string()).or_default()
    }
}

/// The run of same-typed records currently being written.
struct OpenBatch {
    resource_type: String,
    records: u64,
    session: Option<Box<dyn CopySession>>,
}

type StepError = (Option<u64>, LoadErrorKind);

/// Loads sources into a sink, one record at a time, in order.
pub struct Loader {
    sink: DynSink,
    options: LoadOptions,
}

impl Loader {
    pub fn new(sink: DynSink, options: LoadOptions) -> Self {
        Self { sink, options }
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Loads every source in order.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] carrying the partial report when a source
    /// cannot be read or classified (unless skipped by policy), a unit
    /// fails to decode (unless skipped by policy), or the sink rejects a
    /// write. An open copy session is aborted; batches already flushed
    /// stay written.
    pub async fn run(&self, sources: &[Source]) -> Result<LoadReport, LoadError> {
        let started = Instant::now();
        let mut report = LoadReport {
            mode: self.options.mode,
            ..Default::default()
        };
        let mut batch: Option<OpenBatch> = None;
        let mut memory = self.options.memory_usage.then(MemoryReporter::new);

        info!(
            sources = sources.len(),
            mode = %self.options.mode,
            backend = self.sink.backend_name(),
            "Load started"
        );

        for source in sources {
            let mut stream = match source.open() {
                Ok(stream) => stream,
                Err(err)
                    if err.is_unrecognized()
                        && self.options.on_unrecognized == UnrecognizedPolicy::SkipSource =>
                {
                    warn!(source = %source, error = %err, "Skipping source");
                    let mut skipped = SourceReport::new(source.path.clone(), None);
                    skipped.skipped = Some(err.to_string());
                    report.sources.push(skipped);
                    continue;
                }
                Err(err) => {
                    return Err(self
                        .fail(batch, report, started, Some(source), None, err.into())
                        .await);
                }
            };

            info!(source = %source, format = %stream.format(), "Loading source");
            let mut source_report = SourceReport::new(source.path.clone(), Some(stream.format()));
            let result = self
                .load_stream(&mut stream, &mut batch, &mut report, &mut source_report)
                .await;
            source_report.skipped_entries = stream.skipped_entries();
            drop(stream);

            debug!(
                source = %source,
                records = source_report.records,
                skipped_units = source_report.skipped_units,
                "Source finished"
            );
            report.sources.push(source_report);

            if let Err((unit, kind)) = result {
                return Err(self
                    .fail(batch, report, started, Some(source), unit, kind)
                    .await);
            }

            if let Some(memory) = memory.as_mut() {
                memory.report(&source.to_string());
            }
        }

        if let Some(open) = batch.take()
            && let Err(err) = self.close(open, &mut report).await
        {
            return Err(self
                .fail(None, report, started, None, None, err.into())
                .await);
        }

        report.elapsed = started.elapsed();
        info!(
            records = report.records(),
            written = report.written(),
            conflicts = report.conflicts(),
            batches = report.batches,
            skipped_sources = report.skipped_sources(),
            skipped_units = report.skipped_units(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Load finished"
        );
        Ok(report)
    }

    async fn load_stream(
        &self,
        stream: &mut RecordStream,
        batch: &mut Option<OpenBatch>,
        report: &mut LoadReport,
        source_report: &mut SourceReport,
    ) -> Result<(), StepError> {
        loop {
            // Decoding blocks this task between sink writes. The loader is
            // strictly sequential, so there is no other work to starve.
            let Some(item) = stream.next() else {
                return Ok(());
            };

            let record = match item {
                Ok(record) => record,
                Err(err) if err.is_fatal() => return Err((Some(err.unit), err.into())),
                Err(err) if self.options.on_decode_error == DecodePolicy::SkipUnit => {
                    warn!(unit = err.unit, offset = err.offset, error = %err.kind, "Skipping unit");
                    source_report.skipped_units += 1;
                    continue;
                }
                Err(err) => return Err((Some(err.unit), err.into())),
            };

            self.write(record, batch, report)
                .await
                .map_err(|err| (Some(stream.unit()), err.into()))?;
            source_report.records += 1;
        }
    }

    async fn write(
        &self,
        record: Record,
        batch: &mut Option<OpenBatch>,
        report: &mut LoadReport,
    ) -> Result<(), StorageError> {
        let resource_type = record.resource_type();
        let open = match batch.take() {
            Some(open) if open.resource_type == resource_type => batch.insert(open),
            previous => {
                if let Some(previous) = previous {
                    self.close(previous, report).await?;
                }
                batch.insert(self.open(resource_type).await?)
            }
        };

        match &mut open.session {
            Some(session) => session.append(&record).await?,
            None => match self.sink.insert_one(&record).await? {
                InsertOutcome::Written => report.counts(resource_type).written += 1,
                InsertOutcome::Conflict => {
                    debug!(reference = %record.reference(), "Already stored, skipped");
                    report.counts(resource_type).conflicts += 1;
                }
            },
        }
        open.records += 1;
        Ok(())
    }

    async fn open(&self, resource_type: &str) -> Result<OpenBatch, StorageError> {
        let session = match self.options.mode {
            LoadMode::Copy => Some(self.sink.begin_copy(resource_type).await?),
            LoadMode::Insert => None,
        };
        debug!(resource_type, "Batch opened");
        Ok(OpenBatch {
            resource_type: resource_type.to_string(),
            records: 0,
            session,
        })
    }

    async fn close(&self, open: OpenBatch, report: &mut LoadReport) -> Result<(), StorageError> {
        let OpenBatch {
            resource_type,
            records,
            session,
        } = open;

        if let Some(session) = session {
            let rows = session.finish().await?;
            report.counts(&resource_type).written += rows;
        }
        report.counts(&resource_type).batches += 1;
        report.batches += 1;

        debug!(resource_type = %resource_type, records, "Batch flushed");
        Ok(())
    }

    async fn fail(
        &self,
        batch: Option<OpenBatch>,
        mut report: LoadReport,
        started: Instant,
        source: Option<&Source>,
        unit: Option<u64>,
        kind: LoadErrorKind,
    ) -> LoadError {
        if let Some(open) = batch {
            match open.session {
                Some(session) => {
                    warn!(
                        resource_type = %open.resource_type,
                        records = open.records,
                        "Discarding open batch"
                    );
                    if let Err(err) = session.abort(&kind.to_string()).await {
                        warn!(error = %err, "Failed to abort bulk copy");
                    }
                }
                None => {
                    report.counts(&open.resource_type).batches += 1;
                    report.batches += 1;
                }
            }
        }

        report.elapsed = started.elapsed();
        LoadError {
            source_path: source.map(|s| s.path.clone()),
            unit,
            kind,
            report: Box::new(report),
        }
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("backend", &self.sink.backend_name())
            .field("options", &self.options)
            .finish()
    }
}
