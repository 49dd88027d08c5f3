use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{error, trace};
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::ids::Ids;
use crate::index::partition_cache::SharedPartitionCache;
use crate::query::ast::Expression;
use crate::storage::partition::{PartitionHandle, PartitionId};
use crate::system::query::QueryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Evaluation of one expression against one partition
pub struct Job {
    pub query: QueryId,
    pub partition: PartitionId,
    pub expr: Arc<Expression>,
    pub active: Option<PartitionHandle>,   // Set when the target is the active partition
}

pub struct JobResult {
    pub worker: WorkerId,
    pub query: QueryId,
    pub partition: PartitionId,
    pub result: Result<Ids>,
    pub flush_error: Option<Error>,   // Eviction flush failure triggered by this job's load
}

/// Fixed set of evaluation threads. Each worker has its own job channel and
/// all of them report to one result channel.
pub struct WorkerPool {
    jobs: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    results: Sender<JobResult>,
}

impl WorkerPool {
    pub fn spawn(size: usize, cache: SharedPartitionCache, results: Sender<JobResult>) -> Result<Self> {
        let mut jobs = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let (tx, rx) = unbounded();
            let id = WorkerId(i);
            let cache = cache.clone();
            let results = results.clone();
            let handle = thread::Builder::new()
                .name(format!("shardex-{}", id))
                .spawn(move || run_worker(id, rx, cache, results))?;
            jobs.push(tx);
            handles.push(handle);
        }
        Ok(WorkerPool { jobs, handles, results })
    }

    pub fn size(&self) -> usize {
        self.jobs.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        (0..self.jobs.len()).map(WorkerId)
    }

    /// Hands `job` to `worker`. A worker that is gone answers with an error
    /// result so the caller's bookkeeping stays consistent.
    pub fn send(&self, worker: WorkerId, job: Job) {
        let Some(tx) = self.jobs.get(worker.0) else {
            self.reject(worker, job, format!("{} does not exist", worker));
            return;
        };
        if let Err(e) = tx.send(job) {
            let job = e.into_inner();
            error!(%worker, "worker thread is gone");
            self.reject(worker, job, format!("{} stopped", worker));
        }
    }

    fn reject(&self, worker: WorkerId, job: Job, context: String) {
        let _ = self.results.send(JobResult {
            worker,
            query: job.query,
            partition: job.partition,
            result: Err(Error::new(ErrorKind::Internal, context)),
            flush_error: None,
        });
    }

    /// Stops accepting jobs and waits for queued ones to finish
    pub fn shutdown(self) {
        drop(self.jobs);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn run_worker(id: WorkerId, jobs: Receiver<Job>, cache: SharedPartitionCache, results: Sender<JobResult>) {
    while let Ok(job) = jobs.recv() {
        trace!(worker = %id, query = %job.query, partition = %job.partition, "evaluating");
        // Every job reports back, panicking or not.
        let (result, flush_error) = panic::catch_unwind(AssertUnwindSafe(|| evaluate(&cache, &job)))
            .unwrap_or_else(|payload| {
                let reason = panic_reason(payload.as_ref());
                error!(worker = %id, query = %job.query, partition = %job.partition, %reason, "evaluation panicked");
                let context = format!("evaluating partition {} panicked: {}", job.partition, reason);
                (Err(Error::new(ErrorKind::Internal, context)), None)
            });
        let reply = JobResult {
            worker: id,
            query: job.query,
            partition: job.partition,
            result,
            flush_error,
        };
        if results.send(reply).is_err() {
            break;
        }
    }
}

fn evaluate(cache: &SharedPartitionCache, job: &Job) -> (Result<Ids>, Option<Error>) {
    let (partition, flush_error) = match &job.active {
        Some(handle) => (handle.clone(), None),
        None => match cache.get_or_load(&job.partition) {
            Ok(lookup) => (lookup.partition, lookup.flush_error),
            Err(e) => return (Err(e), None),
        },
    };
    // The handle is dropped before replying; only the bitmap leaves the worker.
    let result = partition.write().lookup(&job.expr);
    (result, flush_error)
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
