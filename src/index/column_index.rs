use std::collections::BTreeMap;
use std::net::IpAddr;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{EventId, Subnet, Value, ValueType};
use crate::index::ids::{self, Ids};
use crate::query::ast::RelOp;
use crate::query::validator::check_operand;
use crate::storage::codec;

/// Totally ordered form of a scalar value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
enum ColumnKey {
    Bool(bool),
    Int(i64),
    Count(u64),
    Real(u64),   // Order-preserving bit pattern
    Time(DateTime<Utc>),
    Str(String),
    Addr(IpAddr),
    Subnet(Subnet),
}

impl ColumnKey {
    fn from_value(value: &Value) -> Option<Self> {
        let key = match value {
            Value::Bool(b) => ColumnKey::Bool(*b),
            Value::Int(i) => ColumnKey::Int(*i),
            Value::Count(c) => ColumnKey::Count(*c),
            Value::Real(r) => ColumnKey::Real(real_bits(*r)),
            Value::Time(t) => ColumnKey::Time(*t),
            Value::Str(s) => ColumnKey::Str(s.clone()),
            Value::Addr(a) => ColumnKey::Addr(*a),
            Value::Subnet(s) => ColumnKey::Subnet(*s),
            Value::Null | Value::List(_) => return None,
        };
        Some(key)
    }
}

fn real_bits(x: f64) -> u64 {
    let x = if x == 0.0 { 0.0 } else { x };
    let bits = x.to_bits();
    if bits >> 63 == 1 { !bits } else { bits | (1 << 63) }
}

#[derive(Serialize, Deserialize)]
struct PersistedColumn {
    value_type: ValueType,
    postings: Vec<(ColumnKey, Vec<u8>)>,
    nulls: Vec<u8>,
}

/// Bitmap index over one scalar column: value -> ids carrying that value
pub struct ColumnIndex {
    value_type: ValueType,
    path: PathBuf,
    postings: BTreeMap<ColumnKey, Ids>,
    present: Ids,   // Rows with a non-null value
    nulls: Ids,
    dirty: bool,
}

impl ColumnIndex {
    pub fn new(value_type: ValueType, path: PathBuf) -> Self {
        ColumnIndex {
            value_type,
            path,
            postings: BTreeMap::new(),
            present: Ids::new(),
            nulls: Ids::new(),
            dirty: false,
        }
    }

    /// Restores the column persisted at `path`, or starts empty if the
    /// column was never flushed.
    pub fn open(value_type: ValueType, path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(value_type, path));
        }
        let persisted: PersistedColumn = codec::read_file(&path)?;
        if persisted.value_type != value_type {
            return Err(Error::new(
                ErrorKind::Corrupt,
                format!(
                    "{} holds a {} column, expected {}",
                    path.display(),
                    persisted.value_type,
                    value_type
                ),
            ));
        }
        let mut column = Self::new(value_type, path);
        for (key, bytes) in persisted.postings {
            let set = ids::from_bytes(&bytes)?;
            column.present |= &set;
            column.postings.insert(key, set);
        }
        column.nulls = ids::from_bytes(&persisted.nulls)?;
        Ok(column)
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of distinct non-null values
    pub fn cardinality(&self) -> usize {
        self.postings.len()
    }

    /// Every id recorded in this column, null or not
    pub fn rows(&self) -> Ids {
        &self.present | &self.nulls
    }

    pub fn add(&mut self, value: &Value, id: EventId) -> Result<()> {
        match value {
            Value::Null => {
                self.nulls.insert(id.0);
            }
            v => {
                let key = ColumnKey::from_value(v)
                    .filter(|_| v.value_type() == Some(self.value_type))
                    .ok_or_else(|| {
                        Error::new(
                            ErrorKind::TypeMismatch,
                            format!("cannot add {} to a {} column", v, self.value_type),
                        )
                    })?;
                self.postings.entry(key).or_default().insert(id.0);
                self.present.insert(id.0);
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn lookup(&self, op: RelOp, operand: &Value) -> Result<Ids> {
        check_operand(self.value_type, op, operand)?;
        if op.is_negative() {
            let positive = self.lookup_positive(op.negate(), operand)?;
            return Ok(self.rows() - positive);
        }
        self.lookup_positive(op, operand)
    }

    fn lookup_positive(&self, op: RelOp, operand: &Value) -> Result<Ids> {
        let result = match (op, operand) {
            (RelOp::Equal, Value::Null) => self.nulls.clone(),
            (RelOp::Equal, v) => self.equal(v),
            (RelOp::Less, v) => self.range(Bound::Unbounded, Bound::Excluded(self.key(v)?)),
            (RelOp::LessEqual, v) => self.range(Bound::Unbounded, Bound::Included(self.key(v)?)),
            (RelOp::Greater, v) => self.range(Bound::Excluded(self.key(v)?), Bound::Unbounded),
            (RelOp::GreaterEqual, v) => self.range(Bound::Included(self.key(v)?), Bound::Unbounded),
            (RelOp::In, Value::List(xs)) => {
                let mut result = Ids::new();
                for x in xs {
                    match x {
                        Value::Null => result |= &self.nulls,
                        x => result |= self.equal(x),
                    }
                }
                result
            }
            (RelOp::In, Value::Subnet(net)) => self.scan(|key| match key {
                ColumnKey::Addr(a) => net.contains(a),
                ColumnKey::Subnet(s) => net.contains_subnet(s),
                _ => false,
            }),
            (RelOp::In, Value::Str(haystack)) => self.scan(|key| match key {
                ColumnKey::Str(s) => haystack.contains(s.as_str()),
                _ => false,
            }),
            (RelOp::Ni, Value::Str(needle)) => self.scan(|key| match key {
                ColumnKey::Str(s) => s.contains(needle.as_str()),
                _ => false,
            }),
            (RelOp::Ni, Value::Addr(addr)) => self.scan(|key| match key {
                ColumnKey::Subnet(s) => s.contains(addr),
                _ => false,
            }),
            (RelOp::Ni, Value::Subnet(net)) => self.scan(|key| match key {
                ColumnKey::Subnet(s) => s.contains_subnet(net),
                _ => false,
            }),
            (RelOp::Match, Value::Str(pattern)) => {
                let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    Error::new(ErrorKind::InvalidInput, format!("invalid pattern: {}", e))
                })?;
                self.scan(|key| match key {
                    ColumnKey::Str(s) => regex.is_match(s),
                    _ => false,
                })
            }
            (op, v) => {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("unhandled lookup {} {} on {} column", op, v, self.value_type),
                ));
            }
        };
        Ok(result)
    }

    fn key(&self, value: &Value) -> Result<ColumnKey> {
        ColumnKey::from_value(value).ok_or_else(|| {
            Error::new(ErrorKind::TypeMismatch, format!("{} is not a scalar", value))
        })
    }

    fn equal(&self, value: &Value) -> Ids {
        ColumnKey::from_value(value)
            .and_then(|key| self.postings.get(&key).cloned())
            .unwrap_or_default()
    }

    fn range(&self, lower: Bound<ColumnKey>, upper: Bound<ColumnKey>) -> Ids {
        ids::union_all(self.postings.range((lower, upper)).map(|(_, set)| set))
    }

    fn scan<F: Fn(&ColumnKey) -> bool>(&self, predicate: F) -> Ids {
        ids::union_all(
            self.postings
                .iter()
                .filter(|(key, _)| predicate(key))
                .map(|(_, set)| set),
        )
    }

    pub fn flush_to_disk(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut postings = Vec::with_capacity(self.postings.len());
        for (key, set) in &self.postings {
            postings.push((key.clone(), ids::to_bytes(set)?));
        }
        let persisted = PersistedColumn {
            value_type: self.value_type,
            postings,
            nulls: ids::to_bytes(&self.nulls)?,
        };
        codec::write_file(&self.path, &persisted)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[Option<i64>]) -> ColumnIndex {
        let mut column = ColumnIndex::new(ValueType::Int, PathBuf::from("unused"));
        for (i, v) in values.iter().enumerate() {
            let value = v.map(Value::Int).unwrap_or(Value::Null);
            column.add(&value, EventId(i as u64)).unwrap();
        }
        column
    }

    fn set(xs: &[u64]) -> Ids {
        xs.iter().copied().collect()
    }

    #[test]
    fn relational_operators() {
        let column = ints(&[Some(1), Some(5), Some(-3), None, Some(5)]);
        assert_eq!(column.lookup(RelOp::Equal, &Value::Int(5)).unwrap(), set(&[1, 4]));
        assert_eq!(column.lookup(RelOp::NotEqual, &Value::Int(5)).unwrap(), set(&[0, 2, 3]));
        assert_eq!(column.lookup(RelOp::Less, &Value::Int(1)).unwrap(), set(&[2]));
        assert_eq!(column.lookup(RelOp::LessEqual, &Value::Int(1)).unwrap(), set(&[0, 2]));
        assert_eq!(column.lookup(RelOp::Greater, &Value::Int(1)).unwrap(), set(&[1, 4]));
        assert_eq!(column.lookup(RelOp::GreaterEqual, &Value::Int(-3)).unwrap(), set(&[0, 1, 2, 4]));
        assert_eq!(column.lookup(RelOp::Equal, &Value::Null).unwrap(), set(&[3]));
        let list = Value::List(vec![Value::Int(1), Value::Null]);
        assert_eq!(column.lookup(RelOp::In, &list).unwrap(), set(&[0, 3]));
        assert_eq!(column.lookup(RelOp::NotIn, &list).unwrap(), set(&[1, 2, 4]));
    }

    #[test]
    fn add_is_idempotent() {
        let mut column = ints(&[Some(7)]);
        column.add(&Value::Int(7), EventId(0)).unwrap();
        assert_eq!(column.lookup(RelOp::Equal, &Value::Int(7)).unwrap(), set(&[0]));
        assert_eq!(column.cardinality(), 1);
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let mut column = ints(&[Some(1)]);
        let err = column.lookup(RelOp::Equal, &Value::str("1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert!(column.add(&Value::Count(1), EventId(9)).is_err());
    }

    #[test]
    fn reals_order_across_sign() {
        let mut column = ColumnIndex::new(ValueType::Real, PathBuf::from("unused"));
        for (i, x) in [-2.5, -0.0, 0.0, 1.25, f64::INFINITY].iter().enumerate() {
            column.add(&Value::Real(*x), EventId(i as u64)).unwrap();
        }
        assert_eq!(column.lookup(RelOp::Less, &Value::Real(0.0)).unwrap(), set(&[0]));
        assert_eq!(column.lookup(RelOp::Equal, &Value::Real(0.0)).unwrap(), set(&[1, 2]));
        assert_eq!(column.lookup(RelOp::Greater, &Value::Real(1.0)).unwrap(), set(&[3, 4]));
    }

    #[test]
    fn string_and_network_operators() {
        let mut strings = ColumnIndex::new(ValueType::Str, PathBuf::from("unused"));
        for (i, s) in ["www.example.com", "mail.example.org", "localhost"].iter().enumerate() {
            strings.add(&Value::str(s), EventId(i as u64)).unwrap();
        }
        assert_eq!(strings.lookup(RelOp::Ni, &Value::str("example")).unwrap(), set(&[0, 1]));
        assert_eq!(strings.lookup(RelOp::Match, &Value::str(".*\\.org")).unwrap(), set(&[1]));
        assert_eq!(strings.lookup(RelOp::NotMatch, &Value::str("local.*")).unwrap(), set(&[0, 1]));
        assert_eq!(strings.lookup(RelOp::In, &Value::str("a localhost b")).unwrap(), set(&[2]));
        let err = strings.lookup(RelOp::Match, &Value::str("(")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let mut addrs = ColumnIndex::new(ValueType::Addr, PathBuf::from("unused"));
        for (i, a) in ["10.0.0.1", "10.1.0.1", "192.168.1.1", "::1"].iter().enumerate() {
            addrs.add(&Value::Addr(a.parse().unwrap()), EventId(i as u64)).unwrap();
        }
        let net = Value::Subnet(Subnet::new("10.0.0.0".parse().unwrap(), 8).unwrap());
        assert_eq!(addrs.lookup(RelOp::In, &net).unwrap(), set(&[0, 1]));
        assert_eq!(addrs.lookup(RelOp::NotIn, &net).unwrap(), set(&[2, 3]));
    }
}
