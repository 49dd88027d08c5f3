use std::ops::Range;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{EventId, Value};
use crate::schema::layout::RecordLayout;

/// One event: its timestamp plus one value per layout field
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(timestamp: DateTime<Utc>, values: Vec<Value>) -> Self {
        Row { timestamp, values }
    }
}

/// Typed batch of rows sharing a layout, covering the contiguous id range
/// `offset .. offset + len`.
#[derive(Debug, Clone)]
pub struct TableSlice {
    layout: Arc<RecordLayout>,
    offset: EventId,
    rows: Vec<Row>,
}

impl TableSlice {
    pub fn new(layout: Arc<RecordLayout>, offset: EventId, rows: Vec<Row>) -> Result<Self> {
        layout.validate()?;
        for (i, row) in rows.iter().enumerate() {
            check_row(&layout, row).map_err(|e| {
                Error::new(e.kind, format!("row {} of slice at {}: {}", i, offset.0, e.context))
            })?;
        }
        if offset.0.checked_add(rows.len() as u64).is_none() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("id range starting at {} overflows", offset.0),
            ));
        }
        Ok(TableSlice { layout, offset, rows })
    }

    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    pub fn offset(&self) -> EventId {
        self.offset
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn id_range(&self) -> Range<u64> {
        self.offset.0..self.offset.0 + self.rows.len() as u64
    }

    /// Rows paired with their event ids
    pub fn iter(&self) -> impl Iterator<Item = (EventId, &Row)> {
        let offset = self.offset.0;
        self.rows
            .iter()
            .enumerate()
            .map(move |(i, row)| (EventId(offset + i as u64), row))
    }

    /// Earliest and latest timestamp in the slice
    pub fn time_extent(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.rows.iter().map(|r| r.timestamp).min()?;
        let last = self.rows.iter().map(|r| r.timestamp).max()?;
        Some((first, last))
    }
}

fn check_row(layout: &RecordLayout, row: &Row) -> Result<()> {
    if row.values.len() != layout.len() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("expected {} values, got {}", layout.len(), row.values.len()),
        ));
    }
    for (field, value) in layout.fields.iter().zip(&row.values) {
        match value.value_type() {
            None if value.is_null() => {}
            Some(t) if t == field.field_type => {}
            _ => {
                return Err(Error::new(
                    ErrorKind::TypeMismatch,
                    format!("field {} expects {}, got {}", field.name, field.field_type, value),
                ));
            }
        }
    }
    Ok(())
}
