//! In-process [`DataStore`] used when `storage.enabled` is set and no
//! external database is wired in.
//!
//! Records are kept per table in insertion order; insert ids are a single
//! counter shared across tables, starting at 1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::application::ingestion::{DataStore, InsertReceipt, StorageError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every record stored in `table`.
    pub fn records(&self, table: &str) -> Vec<Value> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn post_data(&self, table: &str, record: Value) -> Result<InsertReceipt, StorageError> {
        if table.is_empty() {
            return Err(StorageError::Backend("table name is empty".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(record);
        Ok(InsertReceipt {
            insert_id: Value::from(id),
        })
    }
}
