// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Priority-aware worker pools for download work.
//!
//! Two independent bounded pools: "coordinators" run one job per queued
//! (item, view) download, and "workers" run the parallel sub-fetches a web
//! download may fan out internally. Higher-ranked jobs drain first, FIFO
//! within a rank. Rank is read from the job at dequeue time, so escalating a
//! still-queued job reorders it in place.
//!
//! Cancellation is cooperative throughout: `cancel_all` signals every queued
//! and running job, and jobs must poll their own flags. `terminate` shuts the
//! pools down under a bounded wait and aborts stragglers.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A unit of work a pool can run.
///
/// `rank` is consulted at dequeue time; `escalate` must never lower it.
#[async_trait]
pub trait PoolJob: Send + Sync {
    /// Current queue rank (higher drains first).
    fn rank(&self) -> u8 {
        0
    }

    /// Raise the rank in place. Implementations must ignore lower ranks.
    fn escalate(&self, _rank: u8) {}

    /// Cooperative cancellation signal. Implementations flip a flag the
    /// running job polls; nothing is interrupted.
    fn cancel(&self) {}

    /// Run the job to completion.
    async fn run(self: Arc<Self>);
}

struct QueuedJob {
    seq: u64,
    job: Arc<dyn PoolJob>,
}

struct PoolShared {
    name: &'static str,
    queue: Mutex<Vec<QueuedJob>>,
    /// One permit per queued job; closed on shutdown so workers drain out.
    slots: Semaphore,
    running: Mutex<HashMap<u64, Arc<dyn PoolJob>>>,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

impl PoolShared {
    /// Remove and return the best queued job: highest rank, then FIFO.
    fn pop_best(&self) -> Option<QueuedJob> {
        let mut queue = self.queue.lock().unwrap();
        let max_rank = queue.iter().map(|e| e.job.rank()).max()?;
        // Entries are pushed in seq order, so the first match is the oldest.
        let pos = queue.iter().position(|e| e.job.rank() == max_rank)?;
        Some(queue.remove(pos))
    }
}

/// A bounded pool of tokio workers draining a priority queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers. Must be called within a tokio runtime.
    pub fn new(name: &'static str, size: usize) -> Self {
        let shared = Arc::new(PoolShared {
            name,
            queue: Mutex::new(Vec::new()),
            slots: Semaphore::new(0),
            running: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(size);
        for _ in 0..size {
            let shared = shared.clone();
            handles.push(tokio::spawn(Self::worker_loop(shared)));
        }

        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    async fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            let permit = match shared.slots.acquire().await {
                Ok(permit) => permit,
                // Semaphore closed: pool is shutting down
                Err(_) => break,
            };
            permit.forget();

            let Some(entry) = shared.pop_best() else {
                continue;
            };
            let seq = entry.seq;
            shared
                .running
                .lock()
                .unwrap()
                .insert(seq, entry.job.clone());
            entry.job.run().await;
            shared.running.lock().unwrap().remove(&seq);
        }
    }

    /// Enqueue a job. Returns `false` (and does nothing) once the pool has
    /// been shut down, so submission never fails silently.
    pub fn submit(&self, job: Arc<dyn PoolJob>) -> bool {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            warn!(pool = self.shared.name, "submit refused: pool is shut down");
            return false;
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        self.shared.queue.lock().unwrap().push(QueuedJob { seq, job });
        self.shared.slots.add_permits(1);
        true
    }

    /// Signal cancellation to every queued and running job. Best effort and
    /// cooperative; does not remove anything from the queue.
    pub fn cancel_all(&self) {
        let queued: Vec<Arc<dyn PoolJob>> = self
            .shared
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.job.clone())
            .collect();
        let running: Vec<Arc<dyn PoolJob>> = self
            .shared
            .running
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        debug!(
            pool = self.shared.name,
            queued = queued.len(),
            running = running.len(),
            "cancelling pool jobs"
        );
        for job in queued.into_iter().chain(running) {
            job.cancel();
        }
    }

    /// Cancel everything, stop the workers, and wait at most `grace` per
    /// worker before aborting it.
    pub async fn terminate(&self, grace: Duration) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.cancel_all();
        self.shared.slots.close();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(pool = self.shared.name, "worker did not stop in time, aborting");
                handle.abort();
            }
        }
        debug!(pool = self.shared.name, "pool terminated");
    }
}

/// Wraps a one-shot future so the workers pool can run it.
struct WorkItem {
    fut: Mutex<Option<BoxFuture<'static, ()>>>,
}

#[async_trait]
impl PoolJob for WorkItem {
    async fn run(self: Arc<Self>) {
        let fut = self.fut.lock().unwrap().take();
        if let Some(fut) = fut {
            fut.await;
        }
    }
}

/// The orchestrator's two pools.
pub struct TaskScheduler {
    coordinators: WorkerPool,
    workers: WorkerPool,
}

impl TaskScheduler {
    pub fn new(coordinator_pool_size: usize, worker_pool_size: usize) -> Self {
        Self {
            coordinators: WorkerPool::new("coordinators", coordinator_pool_size),
            workers: WorkerPool::new("workers", worker_pool_size),
        }
    }

    /// Enqueue a download task on the coordinators pool.
    pub fn submit(&self, job: Arc<dyn PoolJob>) -> bool {
        self.coordinators.submit(job)
    }

    /// Raise a queued/running job's rank in place; never lowers it.
    pub fn escalate(&self, job: &dyn PoolJob, rank: u8) {
        if rank > job.rank() {
            job.escalate(rank);
        }
    }

    /// Submission hook on the workers pool for a fetch implementation's
    /// internal parallel sub-fetches.
    pub fn work<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.workers.submit(Arc::new(WorkItem {
            fut: Mutex::new(Some(Box::pin(fut))),
        }))
    }

    /// Cooperative cancellation signal to every queued and running job on
    /// both pools.
    pub fn cancel_all(&self) {
        self.coordinators.cancel_all();
        self.workers.cancel_all();
    }

    /// Cancel, then shut both pools down under a bounded wait.
    pub async fn terminate(self, grace: Duration) {
        self.coordinators.terminate(grace).await;
        self.workers.terminate(grace).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
