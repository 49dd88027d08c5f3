use std::path::PathBuf;
use regex::Regex;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Value, ValueType};
use crate::index::column_index::ColumnIndex;
use crate::index::ids::{self, Ids};
use crate::query::ast::{Expression, Extractor, Predicate, RelOp, TIME_ATTRIBUTE, TYPE_ATTRIBUTE};
use crate::query::validator::{check_operand, is_compatible};
use crate::schema::layout::RecordLayout;
use crate::slice::table_slice::TableSlice;
use crate::storage::codec;

/// Column indexes of one layout inside one partition.
///
/// Columns are materialized lazily: a fresh table creates them on the first
/// `add`, a reopened table loads each column from disk the first time a
/// lookup touches it.
pub struct TableIndex {
    layout: RecordLayout,
    base_dir: PathBuf,
    columns: Vec<Option<ColumnIndex>>,
    time_column: Option<ColumnIndex>,
    row_ids: Ids,
    dirty: bool,
}

impl TableIndex {
    pub fn new(layout: RecordLayout, base_dir: PathBuf) -> Self {
        let columns = layout.fields.iter().map(|_| None).collect();
        TableIndex {
            layout,
            base_dir,
            columns,
            time_column: None,
            row_ids: Ids::new(),
            dirty: false,
        }
    }

    /// Reopens a flushed table. Only the row ids are read eagerly.
    pub fn open(layout: RecordLayout, base_dir: PathBuf) -> Result<Self> {
        let mut table = Self::new(layout, base_dir);
        let bytes: Vec<u8> = codec::read_file(&table.row_ids_path()).map_err(|e| match e.kind {
            ErrorKind::NotFound => Error::new(
                ErrorKind::Corrupt,
                format!("registered table {} has no row ids", table.base_dir.display()),
            ),
            _ => e,
        })?;
        table.row_ids = ids::from_bytes(&bytes)?;
        Ok(table)
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn row_ids(&self) -> &Ids {
        &self.row_ids
    }

    pub fn rows(&self) -> u64 {
        self.row_ids.len()
    }

    /// Returns whether rows were added since the last flush
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn materialized_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_some()).count()
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    fn row_ids_path(&self) -> PathBuf {
        self.base_dir.join("row_ids")
    }

    /// Columns are stored by position, field names may contain any character.
    fn column_path(&self, index: usize) -> PathBuf {
        self.data_dir().join(format!("{}.idx", index))
    }

    fn with_column(&mut self, index: usize) -> Result<&mut ColumnIndex> {
        let value_type = self.layout.fields[index].field_type;
        let path = self.column_path(index);
        let slot = &mut self.columns[index];
        if slot.is_none() {
            *slot = Some(ColumnIndex::open(value_type, path)?);
        }
        slot.as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Internal, format!("column {} vanished", index)))
    }

    fn with_time_column(&mut self) -> Result<&mut ColumnIndex> {
        let path = self.meta_dir().join("time.idx");
        if self.time_column.is_none() {
            self.time_column = Some(ColumnIndex::open(ValueType::Time, path)?);
        }
        self.time_column
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Internal, "time column vanished".to_string()))
    }

    /// Indexes every row of `slice`. Either the whole slice is recorded or
    /// nothing is.
    pub fn add(&mut self, slice: &TableSlice) -> Result<()> {
        if slice.layout().as_ref() != &self.layout {
            return Err(Error::new(
                ErrorKind::SchemaConflict,
                format!("slice layout {} does not match table layout", slice.layout().name),
            ));
        }
        let mut incoming = Ids::new();
        incoming.insert_range(slice.id_range());
        if !self.row_ids.is_disjoint(&incoming) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("ids {:?} are already indexed", slice.id_range()),
            ));
        }

        // Load or create every column before touching any of them.
        for i in 0..self.columns.len() {
            self.with_column(i)?;
        }
        self.with_time_column()?;

        // TableSlice checked the value types, so recording cannot fail from here on.
        for (i, slot) in self.columns.iter_mut().enumerate() {
            if let Some(column) = slot {
                for (id, row) in slice.iter() {
                    column.add(&row.values[i], id)?;
                }
            }
        }
        if let Some(time) = self.time_column.as_mut() {
            for (id, row) in slice.iter() {
                time.add(&Value::Time(row.timestamp), id)?;
            }
        }
        self.row_ids |= incoming;
        self.dirty = true;
        Ok(())
    }

    /// Evaluates a boolean expression; negation complements against the
    /// rows of this table only.
    pub fn lookup(&mut self, expr: &Expression) -> Result<Ids> {
        match expr {
            Expression::Conjunction(xs) => {
                let mut iter = xs.iter();
                let Some(first) = iter.next() else {
                    return Ok(self.row_ids.clone());
                };
                let mut result = self.lookup(first)?;
                for x in iter {
                    if result.is_empty() {
                        break;
                    }
                    result &= self.lookup(x)?;
                }
                Ok(result)
            }
            Expression::Disjunction(xs) => {
                let mut result = Ids::new();
                for x in xs {
                    result |= self.lookup(x)?;
                }
                Ok(result)
            }
            Expression::Negation(x) => {
                let child = self.lookup(x)?;
                Ok(&self.row_ids - &child)
            }
            Expression::Predicate(pred) => self.lookup_predicate(pred),
        }
    }

    pub fn lookup_predicate(&mut self, pred: &Predicate) -> Result<Ids> {
        match &pred.extractor {
            Extractor::Attribute(name) if name == TYPE_ATTRIBUTE => {
                check_operand(ValueType::Str, pred.op, &pred.value)?;
                if layout_name_matches(&self.layout.name, pred.op, &pred.value)? {
                    Ok(self.row_ids.clone())
                } else {
                    Ok(Ids::new())
                }
            }
            Extractor::Attribute(name) if name == TIME_ATTRIBUTE => {
                self.with_time_column()?.lookup(pred.op, &pred.value)
            }
            Extractor::Attribute(name) => Err(Error::new(
                ErrorKind::UnknownField,
                format!("unknown meta attribute #{}", name),
            )),
            Extractor::Field(key) => {
                // Mistyped operands are rejected per partition; here a field of
                // another type simply matches nothing.
                let usable: Vec<usize> = self
                    .layout
                    .resolve(key)
                    .into_iter()
                    .filter(|&i| is_compatible(self.layout.fields[i].field_type, pred.op, &pred.value))
                    .collect();
                self.union_columns(&usable, pred)
            }
            Extractor::Type(value_type) => {
                let matching = self.layout.fields_of_type(*value_type);
                if matching.is_empty() {
                    return Ok(Ids::new());
                }
                check_operand(*value_type, pred.op, &pred.value)?;
                self.union_columns(&matching, pred)
            }
        }
    }

    fn union_columns(&mut self, indices: &[usize], pred: &Predicate) -> Result<Ids> {
        let mut result = Ids::new();
        for &i in indices {
            result |= self.with_column(i)?.lookup(pred.op, &pred.value)?;
        }
        Ok(result)
    }

    /// Persists every materialized column plus the row ids
    pub fn flush_to_disk(&mut self) -> Result<()> {
        for column in self.columns.iter_mut().flatten() {
            column.flush_to_disk()?;
        }
        if let Some(time) = self.time_column.as_mut() {
            time.flush_to_disk()?;
        }
        if self.dirty {
            codec::write_file(&self.row_ids_path(), &ids::to_bytes(&self.row_ids)?)?;
            self.dirty = false;
        }
        Ok(())
    }
}

fn layout_name_matches(name: &str, op: RelOp, operand: &Value) -> Result<bool> {
    if op.is_negative() {
        return layout_name_matches(name, op.negate(), operand).map(|hit| !hit);
    }
    let hit = match (op, operand) {
        (RelOp::Equal, Value::Str(s)) => name == s,
        (RelOp::Less, Value::Str(s)) => name < s.as_str(),
        (RelOp::LessEqual, Value::Str(s)) => name <= s.as_str(),
        (RelOp::Greater, Value::Str(s)) => name > s.as_str(),
        (RelOp::GreaterEqual, Value::Str(s)) => name >= s.as_str(),
        (RelOp::In, Value::List(xs)) => xs.iter().any(|x| matches!(x, Value::Str(s) if s == name)),
        (RelOp::In, Value::Str(s)) => s.contains(name),
        (RelOp::Ni, Value::Str(s)) => name.contains(s.as_str()),
        (RelOp::Match, Value::Str(pattern)) => Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("invalid pattern: {}", e)))?
            .is_match(name),
        _ => false,
    };
    Ok(hit)
}
