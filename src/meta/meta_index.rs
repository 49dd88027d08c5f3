use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::debug;
use crate::core::error::{ErrorKind, Result};
use crate::core::stats::{put, StatusMap, StatusSource};
use crate::core::types::Value;
use crate::query::ast::{Expression, Extractor, Predicate, RelOp, TIME_ATTRIBUTE, TYPE_ATTRIBUTE};
use crate::slice::table_slice::TableSlice;
use crate::storage::codec;
use crate::storage::partition::PartitionId;

/// Summary of one partition used for pruning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSynopsis {
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub layouts: BTreeSet<String>,
    pub events: u64,
    pub sequence: u64,   // Creation order, newest is largest
    pub sealed: bool,
}

impl PartitionSynopsis {
    fn new(sequence: u64) -> Self {
        PartitionSynopsis {
            first: None,
            last: None,
            layouts: BTreeSet::new(),
            events: 0,
            sequence,
            sealed: false,
        }
    }

    fn covers(&self, at: &DateTime<Utc>) -> bool {
        matches!((&self.first, &self.last), (Some(first), Some(last)) if first <= at && at <= last)
    }

    /// Conservative check: false only when no event of the partition can
    /// satisfy `expr`.
    pub fn may_contain(&self, expr: &Expression) -> bool {
        match expr {
            Expression::Conjunction(xs) => xs.iter().all(|x| self.may_contain(x)),
            Expression::Disjunction(xs) => xs.iter().any(|x| self.may_contain(x)),
            Expression::Negation(_) => true,
            Expression::Predicate(pred) => self.may_satisfy(pred),
        }
    }

    fn may_satisfy(&self, pred: &Predicate) -> bool {
        match &pred.extractor {
            Extractor::Attribute(name) if name == TIME_ATTRIBUTE => self.time_may_satisfy(pred.op, &pred.value),
            Extractor::Attribute(name) if name == TYPE_ATTRIBUTE => match (pred.op, &pred.value) {
                (RelOp::Equal, Value::Str(s)) => self.layouts.contains(s),
                (RelOp::In, Value::List(xs)) => xs
                    .iter()
                    .any(|x| matches!(x, Value::Str(s) if self.layouts.contains(s))),
                _ => true,
            },
            _ => true,
        }
    }

    fn time_may_satisfy(&self, op: RelOp, operand: &Value) -> bool {
        let (Some(first), Some(last)) = (&self.first, &self.last) else {
            return false;
        };
        match (op, operand) {
            (RelOp::Equal, Value::Time(t)) => self.covers(t),
            (RelOp::Less, Value::Time(t)) => first < t,
            (RelOp::LessEqual, Value::Time(t)) => first <= t,
            (RelOp::Greater, Value::Time(t)) => last > t,
            (RelOp::GreaterEqual, Value::Time(t)) => last >= t,
            (RelOp::In, Value::List(xs)) => xs
                .iter()
                .any(|x| matches!(x, Value::Time(t) if self.covers(t))),
            _ => true,
        }
    }
}

/// Per-partition summaries, append-only. Entries are widened while a
/// partition ingests and never removed.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetaIndex {
    synopses: BTreeMap<PartitionId, PartitionSynopsis>,
    next_sequence: u64,
}

impl MetaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a persisted meta-index; a missing file yields an empty one
    pub fn load(path: &Path) -> Result<Self> {
        match codec::read_file::<MetaIndex>(path) {
            Ok(meta) => {
                debug!(partitions = meta.synopses.len(), "loaded meta-index");
                Ok(meta)
            }
            Err(e) if e.kind == ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    pub fn flush_to_disk(&self, path: &Path) -> Result<()> {
        codec::write_file(path, self)
    }

    pub fn len(&self) -> usize {
        self.synopses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synopses.is_empty()
    }

    pub fn get(&self, id: &PartitionId) -> Option<&PartitionSynopsis> {
        self.synopses.get(id)
    }

    /// Widens the synopsis of `id` with the extent of `slice`
    pub fn update(&mut self, id: PartitionId, slice: &TableSlice) {
        let next_sequence = &mut self.next_sequence;
        let synopsis = self.synopses.entry(id).or_insert_with(|| {
            let sequence = *next_sequence;
            *next_sequence += 1;
            PartitionSynopsis::new(sequence)
        });
        if let Some((first, last)) = slice.time_extent() {
            synopsis.first = Some(synopsis.first.map_or(first, |f| f.min(first)));
            synopsis.last = Some(synopsis.last.map_or(last, |l| l.max(last)));
        }
        synopsis.layouts.insert(slice.layout().name.clone());
        synopsis.events += slice.len() as u64;
    }

    /// Marks the extent of `id` as final
    pub fn finalize(&mut self, id: &PartitionId) {
        if let Some(synopsis) = self.synopses.get_mut(id) {
            synopsis.sealed = true;
        }
    }

    /// Seals every entry; used when a previous run left an open partition
    pub fn finalize_all(&mut self) {
        for synopsis in self.synopses.values_mut() {
            synopsis.sealed = true;
        }
    }

    /// Partitions that may hold a match for `expr`, most recent first
    pub fn prune(&self, expr: &Expression) -> Vec<PartitionId> {
        let mut candidates: Vec<(u64, PartitionId)> = self
            .synopses
            .iter()
            .filter(|(_, synopsis)| synopsis.may_contain(expr))
            .map(|(id, synopsis)| (synopsis.sequence, *id))
            .collect();
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        candidates.into_iter().map(|(_, id)| id).collect()
    }
}

impl StatusSource for MetaIndex {
    fn fill_status(&self, prefix: &str, status: &mut StatusMap) {
        let sealed = self.synopses.values().filter(|s| s.sealed).count();
        let events: u64 = self.synopses.values().map(|s| s.events).sum();
        put(status, prefix, "partitions", self.synopses.len());
        put(status, prefix, "sealed", sealed);
        put(status, prefix, "events", events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use chrono::TimeZone;
    use crate::core::types::{EventId, ValueType};
    use crate::schema::layout::RecordLayout;
    use crate::slice::builder::TableSliceBuilder;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn slice(name: &str, first_id: u64, times: &[i64]) -> TableSlice {
        let layout = Arc::new(RecordLayout::new(name).with_field("value", ValueType::Int));
        let mut builder = TableSliceBuilder::new(layout, EventId(first_id));
        for (i, t) in times.iter().enumerate() {
            builder.add(at(*t), vec![Value::Int(i as i64)]);
        }
        builder.finish().unwrap()
    }

    #[test]
    fn prunes_by_time_range() {
        let mut meta = MetaIndex::new();
        let (old, new) = (PartitionId::new(), PartitionId::new());
        meta.update(old, &slice("conn", 0, &[0, 10]));
        meta.update(new, &slice("conn", 2, &[100, 110]));

        let before: Expression = Predicate::time(RelOp::Less, at(50)).into();
        assert_eq!(meta.prune(&before), vec![old]);
        let exact: Expression = Predicate::time(RelOp::Equal, at(105)).into();
        assert_eq!(meta.prune(&exact), vec![new]);
        let gap: Expression = Predicate::time(RelOp::Equal, at(50)).into();
        assert!(meta.prune(&gap).is_empty());
    }

    #[test]
    fn undecidable_queries_return_everything_newest_first() {
        let mut meta = MetaIndex::new();
        let ids: Vec<PartitionId> = (0..3).map(|_| PartitionId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            meta.update(*id, &slice("conn", i as u64 * 10, &[i as i64]));
        }
        let expr: Expression = Predicate::field("value", RelOp::Equal, Value::Int(0)).into();
        let expected: Vec<PartitionId> = ids.iter().rev().copied().collect();
        assert_eq!(meta.prune(&expr), expected);
        let negated = Expression::from(Predicate::time(RelOp::Less, at(-100))).not();
        assert_eq!(meta.prune(&negated).len(), 3);
    }

    #[test]
    fn prunes_by_layout_name() {
        let mut meta = MetaIndex::new();
        let (conn, dns) = (PartitionId::new(), PartitionId::new());
        meta.update(conn, &slice("zeek.conn", 0, &[0]));
        meta.update(dns, &slice("zeek.dns", 1, &[0]));
        let expr: Expression = Predicate::layout_name("zeek.dns").into();
        assert_eq!(meta.prune(&expr), vec![dns]);
    }

    #[test]
    fn updates_only_widen() {
        let mut meta = MetaIndex::new();
        let id = PartitionId::new();
        meta.update(id, &slice("conn", 0, &[10, 20]));
        meta.update(id, &slice("conn", 2, &[15]));
        meta.update(id, &slice("conn", 3, &[5]));
        let synopsis = meta.get(&id).unwrap();
        assert_eq!(synopsis.first, Some(at(5)));
        assert_eq!(synopsis.last, Some(at(20)));
        assert_eq!(synopsis.events, 4);
        assert!(!synopsis.sealed);
        meta.finalize(&id);
        assert!(meta.get(&id).unwrap().sealed);
    }

    #[test]
    fn survives_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta-index");
        let mut meta = MetaIndex::new();
        let id = PartitionId::new();
        meta.update(id, &slice("conn", 0, &[1, 2]));
        meta.flush_to_disk(&path).unwrap();
        let reloaded = MetaIndex::load(&path).unwrap();
        assert_eq!(reloaded.get(&id), meta.get(&id));
        assert!(MetaIndex::load(&dir.path().join("missing")).unwrap().is_empty());
    }
}
