use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fhirload_storage::{CopySession, InsertOutcome, Record, ResourceSink, StorageError};
use serde_json::Value;

pub type StorageKey = String; // Format: "ResourceType/id"

pub(crate) fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// One completed bulk-append, as observed by the sink.
#[derive(Debug, Clone)]
pub struct CopyCall {
    pub resource_type: String,
    pub records: Vec<Record>,
}

#[derive(Debug, Default)]
struct Inner {
    data: DashMap<StorageKey, Value>,
    copies: Mutex<Vec<CopyCall>>,
    inserts: AtomicU64,
}

/// In-memory sink keyed by `ResourceType/id`.
///
/// Mirrors the uniqueness rules of the relational backend: inserts keep the
/// first stored instance, bulk copies fail as a whole on any duplicate.
/// Every finished copy session is logged so callers can inspect batching.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Inner>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored resources.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Number of stored resources of one type.
    pub fn count_by_type(&self, resource_type: &str) -> usize {
        let prefix = format!("{resource_type}/");
        self.inner
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .count()
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<Value> {
        self.inner
            .data
            .get(&make_storage_key(resource_type, id))
            .map(|entry| entry.value().clone())
    }

    /// Completed copy sessions in the order they finished.
    pub fn copy_calls(&self) -> Vec<CopyCall> {
        self.inner
            .copies
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Number of `insert_one` calls received, conflicting or not.
    pub fn insert_calls(&self) -> u64 {
        self.inner.inserts.load(Ordering::SeqCst)
    }
}

/// Returns the record payload with an ID, generating one when absent.
fn with_id(record: &Record) -> (String, Value) {
    let mut resource = record.resource().clone();
    let id = match record.id() {
        Some(id) => id.to_string(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            resource["id"] = Value::String(id.clone());
            id
        }
    };
    (id, resource)
}

#[async_trait]
impl ResourceSink for MemorySink {
    async fn insert_one(&self, record: &Record) -> Result<InsertOutcome, StorageError> {
        self.inner.inserts.fetch_add(1, Ordering::SeqCst);
        let (id, resource) = with_id(record);

        match self
            .inner
            .data
            .entry(make_storage_key(record.resource_type(), &id))
        {
            Entry::Occupied(_) => Ok(InsertOutcome::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(resource);
                Ok(InsertOutcome::Written)
            }
        }
    }

    async fn begin_copy(&self, resource_type: &str) -> Result<Box<dyn CopySession>, StorageError> {
        Ok(Box::new(MemoryCopySession {
            inner: self.inner.clone(),
            resource_type: resource_type.to_string(),
            records: Vec::new(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Buffers appended records and applies them atomically on finish.
struct MemoryCopySession {
    inner: Arc<Inner>,
    resource_type: String,
    records: Vec<Record>,
}

#[async_trait]
impl CopySession for MemoryCopySession {
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
        self.records.push(record.clone());
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64, StorageError> {
        let MemoryCopySession {
            inner,
            resource_type,
            records,
        } = *self;

        let rows: Vec<(StorageKey, Value)> = records
            .iter()
            .map(|record| {
                let (id, resource) = with_id(record);
                (make_storage_key(&resource_type, &id), resource)
            })
            .collect();

        let mut seen = std::collections::HashSet::with_capacity(rows.len());
        for (key, _) in &rows {
            if inner.data.contains_key(key) || !seen.insert(key.as_str()) {
                let id = key.split_once('/').map(|(_, id)| id).unwrap_or(key);
                return Err(StorageError::already_exists(&resource_type, id));
            }
        }

        let count = rows.len() as u64;
        for (key, resource) in rows {
            inner.data.insert(key, resource);
        }

        let mut copies = inner
            .copies
            .lock()
            .map_err(|_| StorageError::internal("copy log poisoned"))?;
        copies.push(CopyCall {
            resource_type,
            records,
        });

        Ok(count)
    }

    async fn abort(self: Box<Self>, _reason: &str) -> Result<(), StorageError> {
        Ok(())
    }
}
