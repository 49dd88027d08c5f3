use std::thread::{self, JoinHandle};
use crossbeam::channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::{debug, error};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::StatusMap;
use crate::query::ast::Expression;
use crate::slice::table_slice::TableSlice;
use crate::storage::partition::PartitionId;
use crate::system::query::{QueryEvent, QueryId, QueryOptions, QueryResponse};
use crate::system::scheduler::{IndexScheduler, SchedulerChannels};

enum Request {
    Ingest(TableSlice, Sender<Result<()>>),
    Query {
        id: QueryId,
        expr: Expression,
        options: QueryOptions,
        sink: Sender<QueryEvent>,
    },
    Cancel(QueryId, Sender<bool>),
    Rotate(Sender<Result<Option<PartitionId>>>),
    Status(Sender<StatusMap>),
    Flush(Sender<Result<()>>),
    Shutdown(Sender<Result<()>>),
}

/// Handle to a running index.
///
/// ```text
///   ingest ──┐                        ┌── worker 0 ──┐
///   query ───┼─► event loop ──jobs───►├── worker 1 ──┼──► partition cache
///   cancel ──┘   (scheduler)          └── worker N ──┘          │
///                    ▲  ▲                    │             disk loader
///                    │  └──────results───────┘
///                    └── flusher ◄── sealed partitions
/// ```
pub struct Index {
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
    strict_queries: bool,
}

impl Index {
    pub fn open(config: Config) -> Result<Self> {
        let strict_queries = config.strict_queries;
        let (scheduler, channels) = IndexScheduler::new(config)?;
        let (requests, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("shardex-scheduler".to_string())
            .spawn(move || run_event_loop(scheduler, rx, channels))?;
        Ok(Index {
            requests,
            thread: Some(thread),
            strict_queries,
        })
    }

    fn call<T>(&self, make: impl FnOnce(Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = bounded(1);
        self.requests.send(make(tx)).map_err(|_| stopped())?;
        rx.recv().map_err(|_| stopped())
    }

    pub fn ingest(&self, slice: TableSlice) -> Result<()> {
        self.call(|reply| Request::Ingest(slice, reply))?
    }

    pub fn query(&self, expr: Expression) -> Result<QueryResponse> {
        self.query_with(expr, QueryOptions { strict: self.strict_queries })
    }

    pub fn query_with(&self, expr: Expression, options: QueryOptions) -> Result<QueryResponse> {
        let id = QueryId::new();
        let (sink, events) = unbounded();
        self.requests
            .send(Request::Query { id, expr, options, sink })
            .map_err(|_| stopped())?;
        Ok(QueryResponse { id, events })
    }

    /// Returns whether the query was still pending
    pub fn cancel(&self, id: QueryId) -> Result<bool> {
        self.call(|reply| Request::Cancel(id, reply))
    }

    /// Seals the active partition if it holds any events
    pub fn rotate(&self) -> Result<Option<PartitionId>> {
        self.call(Request::Rotate)?
    }

    pub fn status(&self) -> Result<StatusMap> {
        self.call(Request::Status)
    }

    pub fn flush(&self) -> Result<()> {
        self.call(Request::Flush)?
    }

    /// Flushes all state and stops every thread
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let result = self.call(Request::Shutdown).and_then(|r| r);
        if thread.join().is_err() {
            error!("scheduler thread panicked");
        }
        result
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "shutdown on drop failed");
        }
    }
}

fn stopped() -> Error {
    Error::new(ErrorKind::InvalidState, "index is shut down".to_string())
}

fn run_event_loop(mut scheduler: IndexScheduler, requests: Receiver<Request>, channels: SchedulerChannels) {
    loop {
        select! {
            recv(requests) -> msg => match msg {
                Ok(Request::Shutdown(reply)) => {
                    let _ = reply.send(scheduler.shutdown());
                    return;
                }
                Ok(request) => handle_request(&mut scheduler, request),
                Err(_) => {
                    debug!("all index handles dropped");
                    let _ = scheduler.shutdown();
                    return;
                }
            },
            recv(channels.results) -> msg => {
                if let Ok(done) = msg {
                    scheduler.on_worker_result(done);
                }
            },
            recv(channels.flushed) -> msg => {
                if let Ok(done) = msg {
                    scheduler.on_flush_done(done);
                }
            },
        }
    }
}

fn handle_request(scheduler: &mut IndexScheduler, request: Request) {
    match request {
        Request::Ingest(slice, reply) => {
            let _ = reply.send(scheduler.ingest(&slice));
        }
        Request::Query { id, expr, options, sink } => scheduler.query(id, expr, options, sink),
        Request::Cancel(id, reply) => {
            let _ = reply.send(scheduler.cancel(&id));
        }
        Request::Rotate(reply) => {
            let _ = reply.send(scheduler.rotate());
        }
        Request::Status(reply) => {
            let _ = reply.send(scheduler.status());
        }
        Request::Flush(reply) => {
            let _ = reply.send(scheduler.flush());
        }
        Request::Shutdown(_) => {}
    }
}
