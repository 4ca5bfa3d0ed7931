//! In-memory row store implementing [`QuerySink`].
//!
//! Keeps the current materialization of one query: column descriptors plus
//! rows keyed by row id, with insertion order preserved. Useful as the
//! model behind a table view and as the reference sink in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::query::QuerySink;

#[derive(Debug, Default)]
struct TableState {
    columns: Vec<Value>,
    /// Row ids in first-insert order.
    order: Vec<String>,
    rows: HashMap<String, Value>,
}

/// Materialized query result. All methods are synchronized on one lock;
/// the async sink methods never await while holding it.
#[derive(Debug, Default)]
pub struct MemoryTable {
    state: Mutex<TableState>,
}

impl MemoryTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Column descriptors in declaration order.
    #[must_use]
    pub fn columns(&self) -> Vec<Value> {
        self.state.lock().expect("table poisoned").columns.clone()
    }

    /// `(row_id, row)` pairs in first-insert order.
    #[must_use]
    pub fn rows(&self) -> Vec<(String, Value)> {
        let state = self.state.lock().expect("table poisoned");
        state
            .order
            .iter()
            .filter_map(|id| state.rows.get(id).map(|row| (id.clone(), row.clone())))
            .collect()
    }

    /// Row values for `row_id`, if present.
    #[must_use]
    pub fn get(&self, row_id: &str) -> Option<Value> {
        self.state.lock().expect("table poisoned").rows.get(row_id).cloned()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("table poisoned").rows.len()
    }

    /// True when no rows are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert(&self, row_id: String, row: Value) {
        let mut state = self.state.lock().expect("table poisoned");
        if state.rows.insert(row_id.clone(), row).is_none() {
            state.order.push(row_id);
        }
    }
}

#[async_trait]
impl QuerySink for MemoryTable {
    async fn reset(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("table poisoned");
        *state = TableState::default();
        Ok(())
    }

    async fn add_column(&self, descriptor: Value) -> anyhow::Result<()> {
        self.state
            .lock()
            .expect("table poisoned")
            .columns
            .push(descriptor);
        Ok(())
    }

    async fn insert_row(&self, row_id: String, row: Value) -> anyhow::Result<()> {
        // Reconnect replays bootstrap data, so an existing id is replaced.
        self.upsert(row_id, row);
        Ok(())
    }

    async fn update_row(&self, row_id: String, row: Value) -> anyhow::Result<()> {
        self.upsert(row_id, row);
        Ok(())
    }

    async fn delete_row(&self, row_id: String) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("table poisoned");
        if state.rows.remove(&row_id).is_some() {
            state.order.retain(|id| id != &row_id);
        }
        Ok(())
    }
}
