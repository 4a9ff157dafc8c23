//! PostgreSQL implementation of the `ResourceSink` trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::pool::{PoolConnection, PoolOptions};
use sqlx_postgres::{PgCopyIn, PgPool, PgPoolCopyExt, Postgres};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use fhirload_storage::{CopySession, InsertOutcome, Record, ResourceSink, StorageError};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, write_error};
use crate::row::{COLUMNS, encode_copy_row, stamp};
use crate::schema::SchemaManager;

/// PostgreSQL sink for FHIR resources.
///
/// Every record written through one sink shares a single transaction id,
/// allocated from `_transaction` on first write. The per-type tables must
/// already exist.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
    schema: SchemaManager,
    txid: Arc<OnceCell<i64>>,
    copy_chunk_bytes: usize,
}

impl PostgresSink {
    /// Connects a pool with the given configuration and checks it with a
    /// round trip.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool size is zero or the server is unreachable.
    #[instrument(skip_all, fields(pool_size = config.pool_size))]
    pub async fn new(config: PostgresConfig) -> Result<Self, StorageError> {
        if config.pool_size == 0 {
            return Err(PostgresError::pool("pool_size must be at least 1").into());
        }

        let mut options = PoolOptions::<Postgres>::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(idle_timeout) = config.idle_timeout_ms {
            options = options.idle_timeout(Duration::from_millis(idle_timeout));
        }

        let pool = options
            .connect(&config.url)
            .await
            .map_err(PostgresError::from)?;
        sqlx_core::query::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(PostgresError::from)?;
        info!("Connected to PostgreSQL");

        let mut sink = Self::from_pool(pool);
        sink.copy_chunk_bytes = config.copy_chunk_bytes;
        Ok(sink)
    }

    /// Creates a new `PostgresSink` from an existing connection pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        let schema = SchemaManager::new(pool.clone());
        Self {
            pool,
            schema,
            txid: Arc::new(OnceCell::new()),
            copy_chunk_bytes: PostgresConfig::default().copy_chunk_bytes,
        }
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Transaction id stamped on every row, allocated on first use.
    pub async fn txid(&self) -> Result<i64, StorageError> {
        let txid = self
            .txid
            .get_or_try_init(|| self.schema.create_transaction())
            .await?;
        Ok(*txid)
    }
}

#[async_trait]
impl ResourceSink for PostgresSink {
    #[instrument(skip(self, record), fields(reference = %record.reference()))]
    async fn insert_one(&self, record: &Record) -> Result<InsertOutcome, StorageError> {
        let resource_type = record.resource_type();
        let table = self.schema.require_table(resource_type).await?;
        let txid = self.txid().await?;
        let now = Utc::now();
        let (id, resource) = stamp(record, txid, now);

        let sql = format!(
            r#"INSERT INTO "{table}" ({COLUMNS})
               VALUES ($1, $2, $3, $3, $4, 'created')
               ON CONFLICT (id) DO NOTHING"#
        );

        let result = sqlx_core::query::query(&sql)
            .bind(&id)
            .bind(txid)
            .bind(now)
            .bind(&resource)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error(resource_type, e, false))?;

        if result.rows_affected() == 0 {
            debug!(id = %id, "Row already present, skipped");
            Ok(InsertOutcome::Conflict)
        } else {
            Ok(InsertOutcome::Written)
        }
    }

    #[instrument(skip(self))]
    async fn begin_copy(&self, resource_type: &str) -> Result<Box<dyn CopySession>, StorageError> {
        let table = self.schema.require_table(resource_type).await?;
        let txid = self.txid().await?;

        let sql = format!(r#"COPY "{table}" ({COLUMNS}) FROM STDIN"#);
        let copy = self
            .pool
            .copy_in_raw(&sql)
            .await
            .map_err(|e| write_error(resource_type, e, true))?;

        debug!(table = %table, txid, "COPY started");

        Ok(Box::new(PgCopySession {
            copy,
            resource_type: resource_type.to_string(),
            txid,
            now: Utc::now(),
            buffer: Vec::with_capacity(self.copy_chunk_bytes),
            chunk_bytes: self.copy_chunk_bytes,
            rows: 0,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// One `COPY ... FROM STDIN` on a pooled connection.
///
/// Rows are buffered and sent in chunks of at least `chunk_bytes`; the
/// server only commits them when the copy finishes.
struct PgCopySession {
    copy: PgCopyIn<PoolConnection<Postgres>>,
    resource_type: String,
    txid: i64,
    now: DateTime<Utc>,
    buffer: Vec<u8>,
    chunk_bytes: usize,
    rows: u64,
}

impl PgCopySession {
    async fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_bytes));
        self.copy
            .send(chunk)
            .await
            .map_err(|e| write_error(&self.resource_type, e, true))?;
        Ok(())
    }
}

#[async_trait]
impl CopySession for PgCopySession {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn append(&mut self, record: &Record) -> Result<(), StorageError> {
        if record.resource_type() != self.resource_type {
            return Err(StorageError::invalid_resource(format!(
                "{} appended to a {} copy",
                record.reference(),
                self.resource_type
            )));
        }

        let (id, resource) = stamp(record, self.txid, self.now);
        encode_copy_row(&mut self.buffer, &id, self.txid, self.now, &resource);
        self.rows += 1;

        if self.buffer.len() >= self.chunk_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, StorageError> {
        self.flush().await?;

        let PgCopySession {
            copy,
            resource_type,
            rows,
            ..
        } = *self;

        let written = copy
            .finish()
            .await
            .map_err(|e| write_error(&resource_type, e, true))?;

        debug!(resource_type = %resource_type, rows, written, "COPY finished");
        Ok(written)
    }

    async fn abort(self: Box<Self>, reason: &str) -> Result<(), StorageError> {
        warn!(resource_type = %self.resource_type, rows = self.rows, reason, "Aborting COPY");
        let resource_type = self.resource_type.clone();
        self.copy
            .abort(reason)
            .await
            .map_err(|e| write_error(&resource_type, e, true))
    }
}
