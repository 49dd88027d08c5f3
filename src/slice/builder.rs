use std::sync::Arc;
use chrono::{DateTime, Utc};
use crate::core::error::Result;
use crate::core::types::{EventId, Value};
use crate::schema::layout::RecordLayout;
use crate::slice::table_slice::{Row, TableSlice};

/// Accumulates rows for one layout and hands out slices with consecutive
/// id ranges.
pub struct TableSliceBuilder {
    layout: Arc<RecordLayout>,
    next_id: u64,
    rows: Vec<Row>,
}

impl TableSliceBuilder {
    pub fn new(layout: Arc<RecordLayout>, first_id: EventId) -> Self {
        TableSliceBuilder {
            layout,
            next_id: first_id.0,
            rows: Vec::new(),
        }
    }

    pub fn add(&mut self, timestamp: DateTime<Utc>, values: Vec<Value>) -> &mut Self {
        self.rows.push(Row::new(timestamp, values));
        self
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    /// Seals the buffered rows into a slice; the builder continues with the
    /// next free id.
    pub fn finish(&mut self) -> Result<TableSlice> {
        let rows = std::mem::take(&mut self.rows);
        let count = rows.len() as u64;
        let slice = TableSlice::new(self.layout.clone(), EventId(self.next_id), rows)?;
        self.next_id += count;
        Ok(slice)
    }
}
