//! Job dispatch for the sync engine.
//!
//! All sync work funnels through one flume queue consumed by a single worker
//! task, so at most one pass runs at a time and passes triggered together run
//! in order. Dispatchers are cheap clones handed to the inbox, the fetch
//! coordinator and the engine itself.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sync::engine::SyncEngine;

/// One unit of sync work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Full refresh: list-and-merge, then push local read/delete state.
    UpdateMessages,
    /// Push-only: local read/delete state, no listing fetch.
    SyncMessageState,
    /// Create or refresh the user identity.
    UpdateUser { forcefully: bool },
}

/// What to do when an equal job is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Drop the new job.
    Keep,
    /// Enqueue regardless.
    Replace,
}

/// Handle for enqueueing jobs.
#[derive(Clone)]
pub struct JobDispatcher {
    tx: flume::Sender<JobKind>,
    queued: Arc<Mutex<Vec<JobKind>>>,
}

/// Receiving side; owned by the worker task.
pub struct JobRunner {
    rx: flume::Receiver<JobKind>,
    queued: Arc<Mutex<Vec<JobKind>>>,
}

impl JobDispatcher {
    pub fn new() -> (JobDispatcher, JobRunner) {
        let (tx, rx) = flume::unbounded();
        let queued = Arc::new(Mutex::new(Vec::new()));
        (
            JobDispatcher {
                tx,
                queued: queued.clone(),
            },
            JobRunner { rx, queued },
        )
    }

    /// Enqueue a job, subject to the conflict policy.
    pub fn dispatch(&self, job: JobKind, policy: ConflictPolicy) {
        {
            let mut queued = self.queued.lock().expect("job queue lock poisoned");
            if policy == ConflictPolicy::Keep && queued.contains(&job) {
                debug!(?job, "Equal job already queued, keeping existing");
                return;
            }
            queued.push(job.clone());
        }

        if self.tx.send(job).is_err() {
            warn!("Job worker is gone, dropping job");
        }
    }
}

impl JobRunner {
    /// Spawn the worker task. Jobs run one at a time, in dispatch order.
    pub fn spawn(self, engine: Arc<SyncEngine>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(job) = self.rx.recv_async().await {
                self.mark_started(&job);
                debug!(?job, "Running sync job");
                engine.perform(job).await;
            }
        })
    }

    fn mark_started(&self, job: &JobKind) {
        let mut queued = self.queued.lock().expect("job queue lock poisoned");
        if let Some(index) = queued.iter().position(|queued_job| queued_job == job) {
            queued.remove(index);
        }
    }

    /// Drain queued jobs without running them (test hook).
    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<JobKind> {
        let mut jobs = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            self.mark_started(&job);
            jobs.push(job);
        }
        jobs
    }
}
