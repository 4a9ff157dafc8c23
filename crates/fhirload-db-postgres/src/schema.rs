//! Schema introspection for the PostgreSQL sink.
//!
//! The sink never creates tables. It relies on the table-per-resource layout
//! produced by the schema tooling: each FHIR resource type has a lowercase
//! table with `(id, txid, created_at, updated_at, resource, status)` columns,
//! and `_transaction` hands out transaction ids.

use std::sync::Arc;

use dashmap::DashSet;
use sqlx_postgres::PgPool;
use tracing::{debug, instrument};

use crate::error::{PostgresError, Result};

/// Verifies and caches the resource tables a sink writes to.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    pool: PgPool,
    /// Tables verified to exist.
    known_tables: Arc<DashSet<String>>,
}

impl SchemaManager {
    /// Creates a new `SchemaManager` with the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            known_tables: Arc::new(DashSet::new()),
        }
    }

    /// Converts a FHIR resource type to a table name.
    ///
    /// Table names are always lowercase to avoid case-sensitivity issues
    /// in PostgreSQL.
    #[must_use]
    pub fn table_name(resource_type: &str) -> String {
        resource_type.to_lowercase()
    }

    /// Checks that a resource type can be used as an identifier in SQL.
    ///
    /// FHIR type names are ASCII letters and digits starting with a letter.
    #[must_use]
    pub fn is_valid_resource_type(resource_type: &str) -> bool {
        let mut chars = resource_type.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric())
    }

    /// Ensures the table for `resource_type` exists, returning its name.
    ///
    /// # Errors
    ///
    /// Returns `PostgresError::MissingTable` if the table is absent, or a
    /// connection error if the lookup fails.
    #[instrument(skip(self), fields(resource_type = %resource_type))]
    pub async fn require_table(&self, resource_type: &str) -> Result<String> {
        if !Self::is_valid_resource_type(resource_type) {
            return Err(PostgresError::missing_table(resource_type));
        }

        let table = Self::table_name(resource_type);
        if self.known_tables.contains(&table) {
            return Ok(table);
        }

        if self.table_exists(&table).await? {
            debug!("Table {} exists in database, adding to cache", table);
            self.known_tables.insert(table.clone());
            Ok(table)
        } else {
            Err(PostgresError::missing_table(resource_type))
        }
    }

    /// Checks if a table exists in the current schema search path.
    #[instrument(skip(self))]
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx_core::query_as::query_as(
            "SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(PostgresError::from)?;

        Ok(row.is_some_and(|(exists,)| exists))
    }

    /// Allocates a new transaction id from `_transaction`.
    #[instrument(skip(self))]
    pub async fn create_transaction(&self) -> Result<i64> {
        let txid: i64 = sqlx_core::query_scalar::query_scalar(
            "INSERT INTO _transaction (status) VALUES ('committed') RETURNING txid",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if crate::error::is_undefined_table(&e) {
                PostgresError::missing_table("_transaction")
            } else {
                PostgresError::from(e)
            }
        })?;

        debug!(txid, "Allocated transaction id");
        Ok(txid)
    }
}
