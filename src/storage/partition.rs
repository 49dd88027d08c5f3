use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use tracing::debug;
use uuid::Uuid;
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::ids::Ids;
use crate::index::table_index::TableIndex;
use crate::core::types::ValueType;
use crate::query::ast::{Expression, Extractor};
use crate::query::validator::{check_operand, is_compatible};
use crate::query::resolver::may_match;
use crate::schema::layout::{LayoutDigest, RecordLayout};
use crate::slice::table_slice::TableSlice;
use crate::storage::codec;

/// Unique partition identifier; also the partition's directory name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub Uuid);

impl PartitionId {
    pub fn new() -> Self {
        PartitionId(Uuid::new_v4())
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PartitionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(PartitionId)
            .map_err(|e| Error::new(ErrorKind::Parse, format!("invalid partition id {:?}: {}", s, e)))
    }
}

/// Persistent registry of the layouts seen by a partition
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub types: BTreeMap<LayoutDigest, RecordLayout>,   // Digest -> layout
    pub events: u64,
    #[serde(skip)]
    pub dirty: bool,
}

/// Horizontal shard of the index: one table index per observed layout
pub struct Partition {
    id: PartitionId,
    dir: PathBuf,
    meta: PartitionMeta,
    tables: HashMap<LayoutDigest, TableIndex>,   // Subset of meta.types, filled lazily
}

/// Shared partition; the lock serializes ingestion and lazy column loading
pub type PartitionHandle = Arc<RwLock<Partition>>;

impl Partition {
    /// Creates an empty partition living in `base_dir/id`
    pub fn new(base_dir: &Path, id: PartitionId) -> Self {
        Partition {
            id,
            dir: base_dir.join(id.to_string()),
            meta: PartitionMeta::default(),
            tables: HashMap::new(),
        }
    }

    /// Restores the layout registry of a flushed partition. Table indexes
    /// are reopened on first use.
    pub fn load(base_dir: &Path, id: PartitionId) -> Result<Self> {
        let dir = base_dir.join(id.to_string());
        if !dir.is_dir() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("partition {} not found in {}", id, base_dir.display()),
            ));
        }
        let meta: PartitionMeta = codec::read_file(&dir.join("meta")).map_err(|e| match e.kind {
            ErrorKind::NotFound => Error::new(ErrorKind::Corrupt, format!("partition {} has no meta file", id)),
            _ => e,
        })?;
        debug!(partition = %id, layouts = meta.types.len(), events = meta.events, "loaded partition");
        Ok(Partition {
            id,
            dir,
            meta,
            tables: HashMap::new(),
        })
    }

    pub fn into_handle(self) -> PartitionHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_file(&self) -> PathBuf {
        self.dir.join("meta")
    }

    /// Returns whether there is state that has not been flushed yet
    pub fn dirty(&self) -> bool {
        self.meta.dirty
    }

    pub fn rows(&self) -> u64 {
        self.meta.events
    }

    pub fn layouts(&self) -> Vec<RecordLayout> {
        self.meta.types.values().cloned().collect()
    }

    pub fn materialized_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn table(&self, digest: &LayoutDigest) -> Option<&TableIndex> {
        self.tables.get(digest)
    }

    fn table_dir(&self, digest: &LayoutDigest) -> PathBuf {
        self.dir.join(digest.as_str())
    }

    fn with_table(&mut self, digest: &LayoutDigest) -> Result<&mut TableIndex> {
        if !self.tables.contains_key(digest) {
            let layout = self.meta.types.get(digest).cloned().ok_or_else(|| {
                Error::new(ErrorKind::NotFound, format!("layout {} not registered in {}", digest, self.id))
            })?;
            let table = TableIndex::open(layout, self.table_dir(digest))?;
            self.tables.insert(digest.clone(), table);
        }
        self.tables
            .get_mut(digest)
            .ok_or_else(|| Error::new(ErrorKind::Internal, format!("table {} vanished", digest)))
    }

    /// Routes a slice to the table index of its layout, registering the
    /// layout on first sight. A rejected slice leaves no trace.
    pub fn add(&mut self, slice: &TableSlice) -> Result<()> {
        let layout = slice.layout();
        let digest = layout.digest();
        match self.meta.types.get(&digest) {
            Some(existing) if existing != layout.as_ref() => {
                return Err(Error::new(
                    ErrorKind::SchemaConflict,
                    format!(
                        "layout {} collides with registered layout {} under digest {}",
                        layout.name, existing.name, digest
                    ),
                ));
            }
            Some(_) => {
                self.with_table(&digest)?.add(slice)?;
            }
            None => {
                let mut table = TableIndex::new(layout.as_ref().clone(), self.table_dir(&digest));
                table.add(slice)?;
                self.tables.insert(digest.clone(), table);
                self.meta.types.insert(digest, layout.as_ref().clone());
            }
        }
        self.meta.events += slice.len() as u64;
        self.meta.dirty = true;
        Ok(())
    }

    /// Persists all materialized tables, then the registry. The dirty flag
    /// is only cleared when every write succeeded.
    pub fn flush_to_disk(&mut self) -> Result<()> {
        if !self.meta.dirty {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        for table in self.tables.values_mut() {
            table.flush_to_disk()?;
        }
        codec::write_file(&self.meta_file(), &self.meta)?;
        self.meta.dirty = false;
        debug!(partition = %self.id, events = self.meta.events, "flushed partition");
        Ok(())
    }

    /// Digests of the tables whose layout can structurally satisfy `expr`
    pub fn lookup_candidates(&self, expr: &Expression) -> Vec<LayoutDigest> {
        self.meta
            .types
            .iter()
            .filter(|(_, layout)| may_match(expr, layout))
            .map(|(digest, _)| digest.clone())
            .collect()
    }

    /// Union of the matches of every candidate table. Predicates whose
    /// operand fits none of the fields they resolve to fail the lookup even
    /// when pruning would have skipped the table.
    pub fn lookup(&mut self, expr: &Expression) -> Result<Ids> {
        self.check_operands(expr)?;
        let mut result = Ids::new();
        for digest in self.lookup_candidates(expr) {
            result |= self.with_table(&digest)?.lookup(expr)?;
        }
        Ok(result)
    }

    fn check_operands(&self, expr: &Expression) -> Result<()> {
        let mut first_error = None;
        expr.for_each_predicate(&mut |pred| {
            if first_error.is_some() {
                return;
            }
            let column_types: Vec<ValueType> = match &pred.extractor {
                Extractor::Field(key) => self
                    .meta
                    .types
                    .values()
                    .flat_map(|layout| layout.resolve(key).into_iter().map(|i| layout.fields[i].field_type))
                    .collect(),
                Extractor::Type(t) if self.meta.types.values().any(|l| !l.fields_of_type(*t).is_empty()) => vec![*t],
                _ => Vec::new(),
            };
            let Some(first) = column_types.first() else {
                return;
            };
            if !column_types.iter().any(|t| is_compatible(*t, pred.op, &pred.value)) {
                first_error = check_operand(*first, pred.op, &pred.value).err();
            }
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
