// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-concurrency background worker with a one-slot, replace-on-submit
//! queue.
//!
//! At most one job runs at a time and at most one waits. Submitting while a
//! job is already waiting replaces it, so a burst of requests collapses to
//! the latest one. Jobs are blocking closures and run on tokio's blocking
//! pool, one after another.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    runtime::Handle,
    sync::{oneshot, Notify},
    task::JoinHandle,
};

use crate::error::{LockError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub submitted: AtomicU64,
    /// Pending jobs dropped in favour of a newer submission.
    pub replaced: AtomicU64,
    pub completed: AtomicU64,
    pub panicked: AtomicU64,
    pub rejected: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub submitted: u64,
    pub replaced: u64,
    pub completed: u64,
    pub panicked: u64,
    pub rejected: u64,
}

struct Shared {
    name: String,
    pending: Mutex<Option<Job>>,
    wake: Notify,
    shutdown: AtomicBool,
    stats: WorkerStats,
}

#[derive(Default)]
struct WorkerTask {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

/// Background worker for lock-breaking cleanup rounds.
pub struct LockBreakingWorker {
    shared: Arc<Shared>,
    task: Mutex<WorkerTask>,
}

impl LockBreakingWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                pending: Mutex::new(None),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
                stats: WorkerStats::default(),
            }),
            task: Mutex::new(WorkerTask::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the worker loop on `runtime`. Starting twice is a no-op.
    pub fn start(&self, runtime: &Handle) -> Result<()> {
        if self.is_shut_down() {
            return Err(self.shutdown_error());
        }

        let mut task = self.task.lock();
        if task.handle.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        task.handle = Some(runtime.spawn(run(shared, shutdown_rx)));
        task.shutdown_tx = Some(shutdown_tx);

        tracing::debug!(worker = %self.shared.name, "worker started");
        Ok(())
    }

    /// Queue `job`, replacing any job still waiting to start.
    ///
    /// Jobs submitted before [`Self::start`] wait for the loop to begin.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(self.shutdown_error());
        }

        let replaced = self.shared.pending.lock().replace(Box::new(job)).is_some();
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.shared.stats.replaced.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(worker = %self.shared.name, "replaced pending job");
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop accepting work, drop the waiting job and cancel the loop.
    ///
    /// Does not wait: a job already handed to the blocking pool runs to
    /// completion on its own. Returns whether a waiting job was dropped.
    pub fn shutdown(&self) -> bool {
        let already = self.shared.shutdown.swap(true, Ordering::AcqRel);
        let dropped = self.shared.pending.lock().take().is_some();

        let mut task = self.task.lock();
        if let Some(tx) = task.shutdown_tx.take() {
            // Loop may already be gone
            tx.send(()).ok();
        }
        if let Some(handle) = task.handle.take() {
            handle.abort();
        }

        if !already {
            tracing::debug!(worker = %self.shared.name, dropped, "worker shut down");
        }
        dropped
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().handle.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.shared.pending.lock().is_some()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn shutdown_error(&self) -> LockError {
        LockError::WorkerShutdown {
            worker: self.shared.name.clone(),
        }
    }
}

impl Drop for LockBreakingWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LockBreakingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockBreakingWorker")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("shut_down", &self.is_shut_down())
            .field("pending", &self.has_pending())
            .finish()
    }
}

async fn run(shared: Arc<Shared>, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            () = shared.wake.notified() => {},
        }

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            let job = shared.pending.lock().take();
            let Some(job) = job else { break };

            match tokio::task::spawn_blocking(job).await {
                Ok(()) => {
                    shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                },
                Err(e) => {
                    shared.stats.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(worker = %shared.name, error = %e, "worker job failed");
                },
            }
        }
    }
    tracing::trace!(worker = %shared.name, "worker loop exited");
}
