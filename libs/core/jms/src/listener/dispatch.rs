//! Bounded worker pool that runs listener callbacks off the delivery task.
//!
//! Sizing follows a classic core/max thread pool:
//! - `min` core workers start immediately and live until shutdown
//! - submissions queue up to `min` pending tasks
//! - when the queue is full, surplus workers start up to `max`; they exit
//!   after `keep_alive` without work
//! - when the queue is full and `max` workers exist, the task is rejected

use super::Concurrency;
use crate::error::{JmsError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Unit of work accepted by the executor.
pub type Task = BoxFuture<'static, ()>;

struct Inner {
    name: String,
    concurrency: Concurrency,
    keep_alive: Duration,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    workers: AtomicUsize,
    busy: AtomicUsize,
    tasks: Mutex<JoinSet<()>>,
    handle: Handle,
}

/// Per-listener dispatch executor. Clones share the same workers.
#[derive(Clone)]
pub struct DispatchExecutor {
    inner: Arc<Inner>,
}

impl DispatchExecutor {
    /// Start the executor with `concurrency.min()` core workers.
    ///
    /// Must be called from within a tokio runtime; workers run on it.
    pub fn new(name: impl Into<String>, concurrency: Concurrency, keep_alive: Duration) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|_| JmsError::Config("dispatch executor requires a tokio runtime".into()))?;
        let (sender, receiver) = mpsc::channel(concurrency.min());
        let executor = Self {
            inner: Arc::new(Inner {
                name: name.into(),
                concurrency,
                keep_alive,
                sender: Mutex::new(Some(sender)),
                receiver: tokio::sync::Mutex::new(receiver),
                workers: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                tasks: Mutex::new(JoinSet::new()),
                handle,
            }),
        };
        for _ in 0..concurrency.min() {
            executor.inner.workers.fetch_add(1, Ordering::SeqCst);
            executor.spawn_worker(None, true);
        }
        debug!(executor = %executor.inner.name, concurrency = %concurrency, "Dispatch executor started");
        Ok(executor)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn concurrency(&self) -> Concurrency {
        self.inner.concurrency
    }

    /// Live workers, core and surplus.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Hand a task to the workers without waiting.
    ///
    /// Fails with [`JmsError::DispatchRejected`] when the queue is full and
    /// every worker slot is taken, and with [`JmsError::Closed`] after
    /// shutdown.
    pub fn try_submit(&self, task: Task) -> Result<()> {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(JmsError::Closed("dispatch executor"))?;

        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(JmsError::Closed("dispatch executor")),
            Err(TrySendError::Full(task)) => {
                if self.reserve_surplus_worker() {
                    if self.spawn_worker(Some(task), false) {
                        Ok(())
                    } else {
                        Err(JmsError::Closed("dispatch executor"))
                    }
                } else {
                    Err(JmsError::DispatchRejected {
                        listener: self.inner.name.clone(),
                        active_workers: self.worker_count(),
                    })
                }
            }
        }
    }

    fn reserve_surplus_worker(&self) -> bool {
        let max = self.inner.concurrency.max();
        self.inner
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Start a worker for a slot already counted in `workers`.
    ///
    /// Returns `false`, giving the slot back, once shutdown has begun:
    /// `shutdown` takes the sender before the task set, so checking under the
    /// task set lock never adds a worker to a set nobody will drain.
    fn spawn_worker(&self, first: Option<Task>, core: bool) -> bool {
        let slot = WorkerSlot(self.inner.clone());
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_shutdown() {
            return false;
        }
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(run_worker(slot, first, core), &self.inner.handle);
        true
    }

    /// Stop accepting work and wait up to `timeout` for queued and running
    /// tasks to finish; whatever is still running then is aborted.
    ///
    /// Returns `true` when everything drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            debug!(executor = %self.inner.name, "Dispatch executor drained");
        } else {
            warn!(
                executor = %self.inner.name,
                busy = self.active_count(),
                "Dispatch executor did not drain in time, aborting workers"
            );
            tasks.shutdown().await;
        }
        drained
    }
}

/// A counted worker; the count drops with it, even when the worker is
/// aborted or never polled.
struct WorkerSlot(Arc<Inner>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks one task as executing until dropped.
struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_worker(slot: WorkerSlot, first: Option<Task>, core: bool) {
    let inner = &slot.0;
    if let Some(task) = first {
        run_task(&inner, task).await;
    }

    loop {
        let next = async {
            let mut receiver = inner.receiver.lock().await;
            receiver.recv().await
        };
        let task = if core {
            next.await
        } else {
            match tokio::time::timeout(inner.keep_alive, next).await {
                Ok(task) => task,
                Err(_) => {
                    debug!(executor = %inner.name, "Surplus worker idle, exiting");
                    None
                }
            }
        };
        match task {
            Some(task) => run_task(inner, task).await,
            None => break,
        }
    }
}

async fn run_task(inner: &Inner, task: Task) {
    let _busy = Busy::enter(&inner.busy);
    if AssertUnwindSafe(task).catch_unwind().await.is_err() {
        error!(executor = %inner.name, "Dispatched task panicked");
    }
}
