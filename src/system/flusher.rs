use std::thread::{self, JoinHandle};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::partition::{PartitionHandle, PartitionId};

pub struct FlushJob {
    pub partition: PartitionId,
    pub handle: PartitionHandle,
}

pub struct FlushResult {
    pub partition: PartitionId,
    pub result: Result<()>,
}

/// Background thread persisting sealed partitions
pub struct Flusher {
    jobs: Sender<FlushJob>,
    handle: JoinHandle<()>,
    results: Sender<FlushResult>,
}

impl Flusher {
    pub fn spawn(results: Sender<FlushResult>) -> Result<Self> {
        let (jobs, rx) = unbounded();
        let worker_results = results.clone();
        let handle = thread::Builder::new()
            .name("shardex-flusher".to_string())
            .spawn(move || run_flusher(rx, worker_results))?;
        Ok(Flusher { jobs, handle, results })
    }

    pub fn submit(&self, job: FlushJob) {
        if let Err(e) = self.jobs.send(job) {
            let job = e.into_inner();
            let _ = self.results.send(FlushResult {
                partition: job.partition,
                result: Err(Error::new(ErrorKind::Internal, "flusher thread is gone".to_string())),
            });
        }
    }

    pub fn shutdown(self) {
        drop(self.jobs);
        let _ = self.handle.join();
    }
}

fn run_flusher(jobs: Receiver<FlushJob>, results: Sender<FlushResult>) {
    while let Ok(job) = jobs.recv() {
        let result = job.handle.write().flush_to_disk();
        debug!(partition = %job.partition, ok = result.is_ok(), "flush finished");
        let reply = FlushResult {
            partition: job.partition,
            result,
        };
        if results.send(reply).is_err() {
            break;
        }
    }
}
