use std::fmt;
use crossbeam::channel::Receiver;
use uuid::Uuid;
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::ids::Ids;
use crate::storage::partition::PartitionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        QueryId(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub strict: bool,   // Fail on the first partition that cannot be loaded
}

impl QueryOptions {
    pub fn strict() -> Self {
        QueryOptions { strict: true }
    }
}

/// A partition whose contribution is missing from a result
#[derive(Debug, Clone)]
pub struct PartitionWarning {
    pub partition: PartitionId,
    pub error: Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct QuerySummary {
    pub hits: u64,
    pub partitions: usize,
    pub warnings: Vec<PartitionWarning>,
}

/// Stream item of a running query. Exactly one `Done` or `Failed` ends it.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Hits {
        partition: PartitionId,
        ids: Ids,
        progress: QueryProgress,
    },
    Done(QuerySummary),
    Failed(Error),
}

/// Lifecycle of an entry in the pending-query table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,       // Nothing dispatched yet
    Dispatching,   // Some partitions still undispatched
    Draining,      // Everything dispatched, waiting for workers
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub ids: Ids,
    pub warnings: Vec<PartitionWarning>,
    pub partitions: usize,
}

/// Caller side of a query. Dropping it cancels the query.
pub struct QueryResponse {
    pub id: QueryId,
    pub events: Receiver<QueryEvent>,
}

impl QueryResponse {
    /// Blocks until the query terminates and merges all partial results
    pub fn wait(self) -> Result<QueryOutcome> {
        let mut ids = Ids::new();
        for event in self.events.iter() {
            match event {
                QueryEvent::Hits { ids: partial, .. } => ids |= partial,
                QueryEvent::Done(summary) => {
                    return Ok(QueryOutcome {
                        ids,
                        warnings: summary.warnings,
                        partitions: summary.partitions,
                    });
                }
                QueryEvent::Failed(e) => return Err(e),
            }
        }
        Err(Error::new(
            ErrorKind::InvalidState,
            format!("query {} ended without a result", self.id),
        ))
    }
}
