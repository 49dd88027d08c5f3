use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{put, StatusMap, StatusSource};
use crate::index::partition_cache::{DiskLoader, PartitionLoader, SharedPartitionCache};
use crate::meta::meta_index::MetaIndex;
use crate::query::ast::Expression;
use crate::slice::table_slice::TableSlice;
use crate::storage::layout::StorageLayout;
use crate::storage::partition::{Partition, PartitionHandle, PartitionId};
use crate::system::flusher::{FlushJob, FlushResult, Flusher};
use crate::system::query::{
    PartitionWarning, QueryEvent, QueryId, QueryOptions, QueryProgress, QueryState, QuerySummary,
};
use crate::system::worker::{Job, JobResult, WorkerId, WorkerPool};

type Unpersisted = Arc<RwLock<HashMap<PartitionId, PartitionHandle>>>;

/// Serves sealed partitions that are still waiting for their flush before
/// falling back to disk.
struct SealedFirstLoader {
    unpersisted: Unpersisted,
    disk: DiskLoader,
}

impl PartitionLoader for SealedFirstLoader {
    fn load(&self, id: &PartitionId) -> Result<PartitionHandle> {
        if let Some(handle) = self.unpersisted.read().get(id) {
            return Ok(handle.clone());
        }
        self.disk.load(id)
    }
}

/// Receiving ends the owner of the scheduler has to drain
pub struct SchedulerChannels {
    pub results: Receiver<JobResult>,
    pub flushed: Receiver<FlushResult>,
}

struct PendingQuery {
    expr: Arc<Expression>,
    options: QueryOptions,
    sink: Sender<QueryEvent>,
    remaining: VecDeque<PartitionId>,   // Undispatched candidates, most recent first
    in_flight: usize,
    completed: usize,
    total: usize,
    hits: u64,
    warnings: Vec<PartitionWarning>,
    state: QueryState,
}

impl PendingQuery {
    fn progress(&self) -> QueryProgress {
        QueryProgress {
            completed: self.completed,
            total: self.total,
        }
    }

    fn update_state(&mut self) {
        self.state = if self.remaining.is_empty() {
            QueryState::Draining
        } else if self.in_flight == 0 && self.completed == 0 {
            QueryState::Pending
        } else {
            QueryState::Dispatching
        };
    }

    fn is_finished(&self) -> bool {
        self.remaining.is_empty() && self.in_flight == 0
    }
}

/// Single-threaded bookkeeping of the index: the active partition, sealed
/// partitions awaiting persistence, the pending-query table and the idle
/// workers. All methods are meant to run on one thread; evaluation and
/// flushing happen on the worker and flusher threads, whose answers come
/// back through [`SchedulerChannels`].
///
/// Pending queries share workers round-robin: a query that still has
/// undispatched partitions goes to the back of the ready queue after each
/// dispatch.
pub struct IndexScheduler {
    config: Config,
    storage: StorageLayout,
    active_id: PartitionId,
    active: PartitionHandle,
    unpersisted: Unpersisted,
    pending_flushes: HashMap<PartitionId, usize>,
    cache: SharedPartitionCache,
    meta: MetaIndex,
    workers: WorkerPool,
    idle: Vec<WorkerId>,
    flusher: Flusher,
    pending: HashMap<QueryId, PendingQuery>,
    ready: VecDeque<QueryId>,
    eviction_flush_failures: u64,
}

impl IndexScheduler {
    pub fn new(config: Config) -> Result<(Self, SchedulerChannels)> {
        config.validate()?;
        let storage = StorageLayout::new(config.storage_path.clone())?;
        let mut meta = MetaIndex::load(&storage.meta_index_path())?;
        meta.finalize_all();

        let unpersisted: Unpersisted = Arc::new(RwLock::new(HashMap::new()));
        let loader: Arc<dyn PartitionLoader> = Arc::new(SealedFirstLoader {
            unpersisted: unpersisted.clone(),
            disk: DiskLoader::new(storage.clone()),
        });
        let cache = SharedPartitionCache::new(config.in_mem_partitions, loader)?;

        let (results_tx, results) = unbounded();
        let (flushed_tx, flushed) = unbounded();
        let workers = WorkerPool::spawn(config.num_workers, cache.clone(), results_tx)?;
        let flusher = Flusher::spawn(flushed_tx)?;

        let active_id = PartitionId::new();
        let active = Partition::new(&storage.base_dir, active_id).into_handle();
        cache.set_active(Some(active_id));
        // Pop order hands out worker 0 first.
        let idle = workers.ids().collect::<Vec<_>>().into_iter().rev().collect();

        info!(
            storage = %storage.base_dir.display(),
            workers = config.num_workers,
            known_partitions = meta.len(),
            "index scheduler started"
        );
        let scheduler = IndexScheduler {
            config,
            storage,
            active_id,
            active,
            unpersisted,
            pending_flushes: HashMap::new(),
            cache,
            meta,
            workers,
            idle,
            flusher,
            pending: HashMap::new(),
            ready: VecDeque::new(),
            eviction_flush_failures: 0,
        };
        Ok((scheduler, SchedulerChannels { results, flushed }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn active_partition(&self) -> PartitionId {
        self.active_id
    }

    pub fn meta_index(&self) -> &MetaIndex {
        &self.meta
    }

    pub fn cache(&self) -> &SharedPartitionCache {
        &self.cache
    }

    pub fn unpersisted_count(&self) -> usize {
        self.unpersisted.read().len()
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.len()
    }

    pub fn query_state(&self, id: &QueryId) -> Option<QueryState> {
        self.pending.get(id).map(|q| q.state)
    }

    /// Adds a slice to the active partition and rotates once the partition
    /// reached its size bound.
    pub fn ingest(&mut self, slice: &TableSlice) -> Result<()> {
        let rows = {
            let mut active = self.active.write();
            active.add(slice)?;
            active.rows()
        };
        self.meta.update(self.active_id, slice);
        if rows >= self.config.max_partition_size {
            self.rotate()?;
        }
        Ok(())
    }

    /// Seals the active partition and starts a fresh one. An empty active
    /// partition is kept.
    pub fn rotate(&mut self) -> Result<Option<PartitionId>> {
        let rows = self.active.read().rows();
        if rows == 0 {
            return Ok(None);
        }
        let sealed_id = self.active_id;
        let fresh_id = PartitionId::new();
        let fresh = Partition::new(&self.storage.base_dir, fresh_id).into_handle();
        let sealed = std::mem::replace(&mut self.active, fresh);
        self.active_id = fresh_id;
        self.cache.set_active(Some(fresh_id));
        self.meta.finalize(&sealed_id);

        self.unpersisted.write().insert(sealed_id, sealed.clone());
        *self.pending_flushes.entry(sealed_id).or_insert(0) += 1;
        self.flusher.submit(FlushJob {
            partition: sealed_id,
            handle: sealed,
        });
        info!(sealed = %sealed_id, rows, active = %fresh_id, "rotated partition");
        Ok(Some(sealed_id))
    }

    pub fn on_flush_done(&mut self, done: FlushResult) {
        if let Some(count) = self.pending_flushes.get_mut(&done.partition) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending_flushes.remove(&done.partition);
            }
        }
        match done.result {
            Ok(()) => {
                if !self.pending_flushes.contains_key(&done.partition) {
                    self.unpersisted.write().remove(&done.partition);
                }
                debug!(partition = %done.partition, "sealed partition persisted");
                if let Err(e) = self.meta.flush_to_disk(&self.storage.meta_index_path()) {
                    warn!(error = %e, "failed to persist meta-index");
                }
            }
            Err(e) => {
                warn!(partition = %done.partition, error = %e, "flush failed, partition stays in memory");
            }
        }
    }

    /// Registers a query and dispatches its taste partitions right away
    pub fn query(&mut self, id: QueryId, expr: Expression, options: QueryOptions, sink: Sender<QueryEvent>) {
        let candidates: VecDeque<PartitionId> = self.meta.prune(&expr).into();
        debug!(query = %id, expr = %expr, candidates = candidates.len(), "query started");
        if candidates.is_empty() {
            let _ = sink.send(QueryEvent::Done(QuerySummary {
                hits: 0,
                partitions: 0,
                warnings: Vec::new(),
            }));
            return;
        }
        let total = candidates.len();
        self.pending.insert(
            id,
            PendingQuery {
                expr: Arc::new(expr),
                options,
                sink,
                remaining: candidates,
                in_flight: 0,
                completed: 0,
                total,
                hits: 0,
                warnings: Vec::new(),
                state: QueryState::Pending,
            },
        );
        for _ in 0..self.config.taste_partitions {
            if !self.dispatch(id) {
                break;
            }
        }
        if self.pending.get(&id).is_some_and(|q| !q.remaining.is_empty()) {
            self.ready.push_back(id);
        }
        self.schedule();
    }

    /// Sends the next partition of `id` to an idle worker. Returns false
    /// when there is no idle worker or nothing left to dispatch.
    pub fn dispatch(&mut self, id: QueryId) -> bool {
        if self.idle.is_empty() {
            return false;
        }
        let Some(query) = self.pending.get_mut(&id) else {
            return false;
        };
        let Some(partition) = query.remaining.pop_front() else {
            return false;
        };
        let Some(worker) = self.idle.pop() else {
            return false;
        };
        query.in_flight += 1;
        query.update_state();
        let active = (partition == self.active_id).then(|| self.active.clone());
        trace!(query = %id, %partition, %worker, "dispatching");
        self.workers.send(
            worker,
            Job {
                query: id,
                partition,
                expr: query.expr.clone(),
                active,
            },
        );
        true
    }

    /// Hands idle workers to ready queries in round-robin order
    pub fn schedule(&mut self) {
        while !self.idle.is_empty() {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            if !self.dispatch(id) {
                continue;
            }
            if self.pending.get(&id).is_some_and(|q| !q.remaining.is_empty()) {
                self.ready.push_back(id);
            }
        }
    }

    pub fn on_worker_result(&mut self, done: JobResult) {
        self.idle.push(done.worker);
        if let Some(e) = &done.flush_error {
            self.eviction_flush_failures += 1;
            warn!(error = %e, "evicted partition could not be flushed");
        }

        let Some(query) = self.pending.get_mut(&done.query) else {
            trace!(query = %done.query, partition = %done.partition, "discarding result of finished query");
            self.schedule();
            return;
        };
        query.in_flight -= 1;
        query.completed += 1;
        let mut failure = None;
        let mut receiver_gone = false;
        match done.result {
            Ok(ids) => {
                query.hits += ids.len();
                let event = QueryEvent::Hits {
                    partition: done.partition,
                    ids,
                    progress: query.progress(),
                };
                receiver_gone = query.sink.send(event).is_err();
            }
            Err(e) if e.is_partition_local() && !query.options.strict => {
                warn!(query = %done.query, partition = %done.partition, error = %e, "partition unavailable");
                query.warnings.push(PartitionWarning {
                    partition: done.partition,
                    error: e,
                });
            }
            Err(e) => failure = Some(e),
        }
        query.update_state();

        if receiver_gone {
            self.cancel(&done.query);
        } else if let Some(e) = failure {
            self.finish(done.query, Err(e));
        } else if query.is_finished() {
            self.finish(done.query, Ok(()));
        }
        self.schedule();
    }

    fn finish(&mut self, id: QueryId, outcome: Result<()>) {
        let Some(query) = self.pending.remove(&id) else {
            return;
        };
        let event = match outcome {
            Ok(()) => {
                info!(query = %id, hits = query.hits, partitions = query.total, warnings = query.warnings.len(), "query done");
                QueryEvent::Done(QuerySummary {
                    hits: query.hits,
                    partitions: query.total,
                    warnings: query.warnings,
                })
            }
            Err(e) => {
                warn!(query = %id, error = %e, "query failed");
                QueryEvent::Failed(e)
            }
        };
        let _ = query.sink.send(event);
    }

    /// Drops a pending query; results still in flight are discarded
    pub fn cancel(&mut self, id: &QueryId) -> bool {
        let removed = self.pending.remove(id).is_some();
        if removed {
            debug!(query = %id, "query cancelled");
        }
        removed
    }

    /// Persists the active partition, retries every sealed partition that
    /// is not on disk yet, retries pinned cache entries and writes the
    /// meta-index. The first error is returned after all steps ran.
    pub fn flush(&mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        if let Err(e) = self.active.write().flush_to_disk() {
            first_error.get_or_insert(e);
        }

        let sealed: Vec<(PartitionId, PartitionHandle)> = self
            .unpersisted
            .read()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        for (id, handle) in sealed {
            match handle.write().flush_to_disk() {
                Ok(()) => {
                    self.unpersisted.write().remove(&id);
                }
                Err(e) => {
                    warn!(partition = %id, error = %e, "flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.cache.flush_pinned() {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.meta.flush_to_disk(&self.storage.meta_index_path()) {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> StatusMap {
        let mut status = StatusMap::new();
        self.fill_status("scheduler", &mut status);
        self.cache.fill_status("cache", &mut status);
        self.meta.fill_status("meta", &mut status);
        status
    }

    /// Flushes everything, fails the queries that are still pending and
    /// joins all threads.
    pub fn shutdown(mut self) -> Result<()> {
        let flushed = self.flush();
        for (id, query) in self.pending.drain() {
            let _ = query.sink.send(QueryEvent::Failed(Error::new(
                ErrorKind::InvalidState,
                format!("index shut down while query {} was running", id),
            )));
        }
        self.workers.shutdown();
        self.flusher.shutdown();
        info!("index scheduler stopped");
        flushed
    }
}

impl StatusSource for IndexScheduler {
    fn fill_status(&self, prefix: &str, status: &mut StatusMap) {
        let size = self.workers.size();
        put(status, prefix, "active_partition", self.active_id.to_string());
        put(status, prefix, "active_rows", self.active.read().rows());
        put(status, prefix, "unpersisted", self.unpersisted.read().len());
        put(status, prefix, "pending_queries", self.pending.len());
        put(status, prefix, "workers", size);
        put(status, prefix, "idle_workers", self.idle.len());
        put(status, prefix, "busy_workers", size - self.idle.len());
        put(status, prefix, "eviction_flush_failures", self.eviction_flush_failures);
    }
}
