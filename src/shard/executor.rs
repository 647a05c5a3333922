//! Shard run-loops and cross-shard dispatch
//!
//! Each shard runs on its own OS thread with a current-thread Tokio runtime
//! and a `LocalSet`. Work arrives over an unbounded channel:
//!
//! ```text
//! caller ──ShardTask──▶ [shard-0 queue] ──▶ run-loop ─┬─ Brief: run inline, in order
//!        ──ShardTask──▶ [shard-1 queue]               └─ Fiber: spawn_local, may yield
//! ```
//!
//! Brief tasks run to completion between fiber steps, so a fiber that yields
//! lets queued commands through. Results travel back on oneshot channels; a
//! task that panics drops its sender and surfaces as `Error::ShardFailed`.

use super::engine_shard::EngineShard;
use super::ShardId;
use crate::error::{Error, Result};
use crate::metrics::FANOUTS_TOTAL;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, error, warn};

/// A shard-local future; never leaves its shard thread
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

type BriefFn = Box<dyn FnOnce(&EngineShard) + Send>;
type FiberFn = Box<dyn FnOnce(Rc<EngineShard>) -> LocalBoxFuture<()> + Send>;

enum ShardTask {
    /// Runs synchronously on the run-loop, never suspends
    Brief(BriefFn),
    /// Spawned as a local task, may suspend at yield points
    Fiber(FiberFn),
}

/// Voluntarily suspend the current shard task
///
/// Lets queued brief tasks and other fibers on the same shard make progress.
pub async fn yield_now() {
    tokio::task::yield_now().await
}

/// Handle to the fixed set of shard run-loops
pub struct ShardSet {
    queues: Vec<mpsc::UnboundedSender<ShardTask>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("size", &self.queues.len())
            .finish()
    }
}

impl ShardSet {
    /// Starts `shard_count` run-loops
    pub fn new(shard_count: usize, max_databases: usize) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Config("shard count must be positive".to_string()));
        }

        let mut queues = Vec::with_capacity(shard_count);
        let mut threads = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            let shard_id = i as ShardId;
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = std::thread::Builder::new()
                .name(format!("shard-{}", shard_id))
                .spawn(move || run_shard(shard_id, max_databases, rx))?;
            queues.push(tx);
            threads.push(handle);
        }
        debug!(shard_count, "Shard set started");

        Ok(Self {
            queues,
            threads: Mutex::new(threads),
        })
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    fn send(&self, sid: ShardId, task: ShardTask) -> Result<()> {
        self.queues
            .get(sid as usize)
            .ok_or_else(|| Error::Internal(format!("shard {} does not exist", sid)))?
            .send(task)
            .map_err(|_| Error::ShardFailed(sid))
    }

    /// Run `f` on shard `sid`, fire-and-forget
    pub fn add<F>(&self, sid: ShardId, f: F) -> Result<()>
    where
        F: FnOnce(&EngineShard) + Send + 'static,
    {
        self.send(sid, ShardTask::Brief(Box::new(f)))
    }

    /// Queue `f` on shard `sid` and return a receiver for its result
    pub fn dispatch<F, R>(&self, sid: ShardId, f: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(&EngineShard) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(
            sid,
            ShardTask::Brief(Box::new(move |shard| {
                let _ = tx.send(f(shard));
            })),
        )?;
        Ok(rx)
    }

    /// Queue a suspendable task on shard `sid` and return a receiver for its result
    pub fn dispatch_fiber<F, Fut, R>(&self, sid: ShardId, f: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(Rc<EngineShard>) -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(
            sid,
            ShardTask::Fiber(Box::new(move |shard| {
                Box::pin(async move {
                    let _ = tx.send(f(shard).await);
                })
            })),
        )?;
        Ok(rx)
    }

    /// Run `f` on shard `sid` and wait for its result
    pub async fn await_on<F, R>(&self, sid: ShardId, f: F) -> Result<R>
    where
        F: FnOnce(&EngineShard) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dispatch(sid, f)?
            .await
            .map_err(|_| Error::ShardFailed(sid))
    }

    /// Run a suspendable task on shard `sid` and wait for its result
    pub async fn await_fiber_on<F, Fut, R>(&self, sid: ShardId, f: F) -> Result<R>
    where
        F: FnOnce(Rc<EngineShard>) -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        self.dispatch_fiber(sid, f)?
            .await
            .map_err(|_| Error::ShardFailed(sid))
    }

    /// Run a non-suspending callback on every shard concurrently
    ///
    /// Returns one result per shard, indexed by shard id, once all shards
    /// have finished.
    pub async fn run_brief_in_parallel<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(&EngineShard) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        FANOUTS_TOTAL.with_label_values(&["brief"]).inc();
        let f = Arc::new(f);
        let mut slots = Vec::with_capacity(self.size());
        for sid in 0..self.size() {
            let f = Arc::clone(&f);
            slots.push(self.dispatch(sid as ShardId, move |shard| f(shard)));
        }
        join_slots(slots).await
    }

    /// Run a callback that may suspend on every shard concurrently
    ///
    /// Same barrier semantics as [`ShardSet::run_brief_in_parallel`].
    pub async fn run_blocking_in_parallel<F, Fut, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Rc<EngineShard>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        FANOUTS_TOTAL.with_label_values(&["blocking"]).inc();
        let f = Arc::new(f);
        let mut slots = Vec::with_capacity(self.size());
        for sid in 0..self.size() {
            let f = Arc::clone(&f);
            slots.push(self.dispatch_fiber(sid as ShardId, move |shard| f(shard)));
        }
        join_slots(slots).await
    }
}

/// Waits for every slot, in shard order, before reporting
///
/// The first failing shard decides the error, but only after all other
/// shards have finished, so no shard is still running when the caller moves
/// on.
pub async fn join_slots<R>(slots: Vec<Result<oneshot::Receiver<R>>>) -> Result<Vec<R>> {
    let mut results = Vec::with_capacity(slots.len());
    let mut failure = None;
    for (sid, slot) in slots.into_iter().enumerate() {
        let outcome = match slot {
            Ok(rx) => rx.await.map_err(|_| Error::ShardFailed(sid as ShardId)),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(value) => results.push(value),
            Err(e) => {
                warn!(shard = sid, error = %e, "Shard failed during fan-out");
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        self.queues.clear();
        let current = std::thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Shard thread panicked during shutdown");
            }
        }
    }
}

fn run_shard(shard_id: ShardId, max_databases: usize, mut rx: mpsc::UnboundedReceiver<ShardTask>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(shard = shard_id, error = %e, "Failed to build shard runtime");
            return;
        }
    };

    let shard = Rc::new(EngineShard::new(shard_id, max_databases));
    let local = LocalSet::new();
    local.block_on(&runtime, async {
        while let Some(task) = rx.recv().await {
            match task {
                ShardTask::Brief(f) => {
                    if catch_unwind(AssertUnwindSafe(|| f(&shard))).is_err() {
                        warn!(shard = shard_id, "Brief task panicked");
                    }
                }
                ShardTask::Fiber(f) => {
                    tokio::task::spawn_local(f(Rc::clone(&shard)));
                }
            }
        }
    });
    // Queue closed: let in-flight fibers finish before the shard goes away
    runtime.block_on(local);
    debug!(shard = shard_id, "Shard run-loop stopped");
}
