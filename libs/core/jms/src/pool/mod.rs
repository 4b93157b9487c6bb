//! Bounded, fail-fast resource pools.
//!
//! [`ResourcePool`] is generic over a [`PoolManager`] that knows how to create,
//! reset and destroy one kind of resource. The pool itself only does
//! bookkeeping:
//!
//! - idle resources are partitioned by the key they were created with, so a
//!   transacted session is never handed to a caller asking for an
//!   auto-acknowledging one and a producer bound to `A` never serves `B`
//! - reuse is LIFO within a key
//! - `idle + active <= max_size` holds at every instant; a request that finds
//!   no idle resource of its key at full capacity evicts an idle resource of
//!   another key, and fails with [`JmsError::PoolExhausted`] when there is none
//! - `request()` never waits on contention
//!
//! The connection, session and producer pools in the submodules nest these
//! pools the way the protocol nests its objects.

mod connection;
mod producer;
mod registry;
mod session;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionPool, PooledConnection};
pub use producer::{PooledProducer, ProducerManager, ProducerPool};
pub use registry::PoolRegistry;
pub use session::{PooledSession, SessionHandle, SessionKey, SessionManager, SessionPool};

use crate::config::PoolConfig;
use crate::error::{JmsError, Result};
use crate::metrics::{PoolMetrics, RequestOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Creates, resets and destroys the resources of one pool.
///
/// Resources are cheap handles (usually `Arc`-wrapped protocol objects), so a
/// clone refers to the same underlying object.
#[async_trait]
pub trait PoolManager: Send + Sync + 'static {
    /// Creation arguments; idle resources are partitioned by key.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    type Resource: Clone + Send + Sync + 'static;

    /// Label used in errors, logs and metrics.
    fn kind(&self) -> &'static str;

    async fn create(&self, key: &Self::Key) -> Result<Self::Resource>;

    /// Bring a returned resource back to a fresh state.
    ///
    /// An error discards the resource instead of returning it to idle.
    async fn reset(&self, _resource: &Self::Resource) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, resource: Self::Resource);
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub active: usize,
    pub max_size: usize,
}

struct Idle<R> {
    id: u64,
    resource: R,
}

struct PoolState<K, R> {
    idle: HashMap<K, Vec<Idle<R>>>,
    idle_count: usize,
    /// Checked-out ids, including slots reserved for in-flight creations.
    active: HashMap<u64, K>,
    closed: bool,
}

impl<K: Eq + Hash, R> PoolState<K, R> {
    fn total(&self) -> usize {
        self.idle_count + self.active.len()
    }

    fn pop_idle(&mut self, key: &K) -> Option<Idle<R>> {
        let bucket = self.idle.get_mut(key)?;
        let idle = bucket.pop()?;
        if bucket.is_empty() {
            self.idle.remove(key);
        }
        self.idle_count -= 1;
        Some(idle)
    }

    /// Remove the oldest idle resource of any key other than `key`.
    fn evict_other(&mut self, key: &K) -> Option<R>
    where
        K: Clone,
    {
        let victim = self.idle.keys().find(|k| *k != key).cloned()?;
        let bucket = self.idle.get_mut(&victim)?;
        let evicted = bucket.remove(0);
        if bucket.is_empty() {
            self.idle.remove(&victim);
        }
        self.idle_count -= 1;
        Some(evicted.resource)
    }

    fn push_idle(&mut self, key: K, id: u64, resource: R) {
        self.idle.entry(key).or_default().push(Idle { id, resource });
        self.idle_count += 1;
    }

    fn drain_idle(&mut self) -> Vec<R> {
        self.idle_count = 0;
        self.idle
            .drain()
            .flat_map(|(_, bucket)| bucket.into_iter().map(|idle| idle.resource))
            .collect()
    }
}

enum Reserved<R> {
    Reused { id: u64, resource: R },
    Create { id: u64, evicted: Option<R> },
}

struct Shared<M: PoolManager> {
    name: String,
    config: PoolConfig,
    reset_on_release: bool,
    manager: M,
    state: Mutex<PoolState<M::Key, M::Resource>>,
    next_id: AtomicU64,
    metrics: PoolMetrics,
}

impl<M: PoolManager> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Key, M::Resource>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &PoolState<M::Key, M::Resource>) {
        self.metrics.occupancy(state.idle_count, state.active.len());
    }

    fn exhausted(&self, active: usize) -> JmsError {
        JmsError::PoolExhausted {
            pool: self.name.clone(),
            active,
            max_size: self.config.max_size,
        }
    }

    /// Decide how to satisfy a request without awaiting anything.
    fn reserve(&self, key: &M::Key) -> Result<Reserved<M::Resource>> {
        let mut state = self.lock();
        if state.closed {
            return Err(JmsError::Closed(self.manager.kind()));
        }

        if let Some(idle) = state.pop_idle(key) {
            state.active.insert(idle.id, key.clone());
            self.record(&state);
            return Ok(Reserved::Reused {
                id: idle.id,
                resource: idle.resource,
            });
        }

        let evicted = if state.total() < self.config.max_size {
            None
        } else {
            match state.evict_other(key) {
                Some(resource) => Some(resource),
                None => return Err(self.exhausted(state.active.len())),
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.active.insert(id, key.clone());
        self.record(&state);
        Ok(Reserved::Create { id, evicted })
    }

    fn forget(&self, id: u64) {
        let mut state = self.lock();
        state.active.remove(&id);
        self.record(&state);
    }

    async fn give_back(&self, id: u64, key: M::Key, resource: M::Resource) -> Result<()> {
        if !self.lock().active.contains_key(&id) {
            self.manager.destroy(resource).await;
            return Err(JmsError::NotActive {
                pool: self.name.clone(),
                id,
            });
        }

        if self.reset_on_release {
            if let Err(e) = self.manager.reset(&resource).await {
                warn!(pool = %self.name, id, error = %e, "Reset failed, discarding resource");
                self.forget(id);
                self.manager.destroy(resource).await;
                return Ok(());
            }
        }

        let discard = {
            let mut state = self.lock();
            let was_active = state.active.remove(&id).is_some();
            let discard = !was_active || state.closed;
            if !discard {
                state.push_idle(key, id, resource.clone());
            }
            self.record(&state);
            discard
        };
        if discard {
            self.manager.destroy(resource).await;
        }
        debug!(pool = %self.name, id, "Resource released");
        Ok(())
    }

    async fn warm_one(&self, key: M::Key) {
        let id = {
            let mut state = self.lock();
            if state.closed || state.total() >= self.config.max_size {
                return;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            state.active.insert(id, key.clone());
            id
        };

        match self.manager.create(&key).await {
            Ok(resource) => {
                let keep = {
                    let mut state = self.lock();
                    let keep = state.active.remove(&id).is_some() && !state.closed;
                    if keep {
                        state.push_idle(key, id, resource.clone());
                    }
                    self.record(&state);
                    keep
                };
                if !keep {
                    self.manager.destroy(resource).await;
                }
            }
            Err(e) => {
                self.forget(id);
                warn!(pool = %self.name, error = %e, "Pre-warming {} failed", self.manager.kind());
            }
        }
    }
}

/// Releases a creation slot if the request is abandoned before it completes.
struct Reservation<M: PoolManager> {
    shared: Arc<Shared<M>>,
    id: u64,
    armed: bool,
}

impl<M: PoolManager> Drop for Reservation<M> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget(self.id);
        }
    }
}

/// A bounded pool of resources produced by `M`.
pub struct ResourcePool<M: PoolManager> {
    shared: Arc<Shared<M>>,
}

impl<M: PoolManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: PoolManager> ResourcePool<M> {
    pub fn new(name: impl Into<String>, config: PoolConfig, reset_on_release: bool, manager: M) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(Shared {
                metrics: PoolMetrics::new(name.clone()),
                name,
                config,
                reset_on_release,
                manager,
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    idle_count: 0,
                    active: HashMap::new(),
                    closed: false,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            idle: state.idle_count,
            active: state.active.len(),
            max_size: self.shared.config.max_size,
        }
    }

    /// Check out a resource created with `key`.
    pub async fn request(&self, key: M::Key) -> Result<Pooled<M>> {
        let shared = &self.shared;
        let reserved = match shared.reserve(&key) {
            Ok(reserved) => reserved,
            Err(e) => {
                if matches!(e, JmsError::PoolExhausted { .. }) {
                    shared.metrics.request(RequestOutcome::Exhausted);
                    debug!(pool = %shared.name, key = ?key, "Pool exhausted");
                }
                return Err(e);
            }
        };

        match reserved {
            Reserved::Reused { id, resource } => {
                shared.metrics.request(RequestOutcome::Reused);
                debug!(pool = %shared.name, id, key = ?key, "Reusing idle {}", shared.manager.kind());
                Ok(Pooled::new(shared.clone(), id, key, resource))
            }
            Reserved::Create { id, evicted } => {
                let mut reservation = Reservation {
                    shared: shared.clone(),
                    id,
                    armed: true,
                };
                if let Some(resource) = evicted {
                    debug!(pool = %shared.name, key = ?key, "Evicting idle {} of another key", shared.manager.kind());
                    shared.manager.destroy(resource).await;
                }

                match shared.manager.create(&key).await {
                    Ok(resource) => {
                        reservation.armed = false;
                        shared.metrics.request(RequestOutcome::Created);
                        debug!(pool = %shared.name, id, key = ?key, "Created {}", shared.manager.kind());
                        Ok(Pooled::new(shared.clone(), id, key, resource))
                    }
                    Err(e) => {
                        shared.metrics.request(RequestOutcome::Failed);
                        warn!(pool = %shared.name, key = ?key, error = %e, "Failed to create {}", shared.manager.kind());
                        Err(JmsError::creation(shared.manager.kind(), e))
                    }
                }
            }
        }
    }

    /// Return a checkout to this pool.
    ///
    /// Fails with [`JmsError::NotActive`] when the checkout belongs to another
    /// pool or was invalidated by [`close`](Self::close).
    pub async fn release(&self, pooled: Pooled<M>) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &pooled.shared) {
            return Err(JmsError::NotActive {
                pool: self.shared.name.clone(),
                id: pooled.id,
            });
        }
        pooled.release().await
    }

    /// Create up to `count` idle resources on background tasks.
    ///
    /// Each creation is independent; failures are logged and do not affect
    /// the others. Without a running tokio runtime nothing is spawned.
    pub fn warm(&self, key: M::Key, count: usize) -> Vec<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            warn!(pool = %self.shared.name, "No tokio runtime, skipping pre-warm");
            return Vec::new();
        };
        (0..count)
            .map(|_| {
                let shared = self.shared.clone();
                let key = key.clone();
                handle.spawn(async move { shared.warm_one(key).await })
            })
            .collect()
    }

    /// Destroy idle resources and invalidate outstanding checkouts.
    ///
    /// Checkouts returned afterwards are destroyed instead of pooled.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.active.clear();
            let idle = state.drain_idle();
            self.shared.record(&state);
            idle
        };
        debug!(pool = %self.shared.name, idle = idle.len(), "Closing pool");
        for resource in idle {
            self.shared.manager.destroy(resource).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// A checked-out resource.
///
/// Dereferences to the resource. [`release`](Self::release) returns it to the
/// pool; dropping an unreleased checkout returns it on a background task.
pub struct Pooled<M: PoolManager> {
    shared: Arc<Shared<M>>,
    id: u64,
    key: M::Key,
    resource: M::Resource,
    released: bool,
}

impl<M: PoolManager> Pooled<M> {
    fn new(shared: Arc<Shared<M>>, id: u64, key: M::Key, resource: M::Resource) -> Self {
        Self {
            shared,
            id,
            key,
            resource,
            released: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &M::Key {
        &self.key
    }

    pub fn pool_name(&self) -> &str {
        &self.shared.name
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.shared
            .give_back(self.id, self.key.clone(), self.resource.clone())
            .await
    }
}

impl<M: PoolManager> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<M: PoolManager> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.shared.name)
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl<M: PoolManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let shared = self.shared.clone();
        let (id, key, resource) = (self.id, self.key.clone(), self.resource.clone());
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = shared.give_back(id, key, resource).await {
                        debug!(error = %e, "Dropped checkout was not returned");
                    }
                });
            }
            // No runtime to run reset on; give up the slot instead.
            Err(_) => shared.forget(id),
        }
    }
}

/// Slot holding a checkout until its wrapper is closed.
pub(crate) struct Lease<M: PoolManager> {
    what: &'static str,
    slot: Mutex<Option<Pooled<M>>>,
}

impl<M: PoolManager> Lease<M> {
    pub(crate) fn new(what: &'static str, pooled: Pooled<M>) -> Self {
        Self {
            what,
            slot: Mutex::new(Some(pooled)),
        }
    }

    pub(crate) fn id(&self) -> Option<u64> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Pooled::id)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.id().is_some() {
            Ok(())
        } else {
            Err(JmsError::Closed(self.what))
        }
    }

    /// Return the checkout to its pool. Later calls are no-ops.
    pub(crate) async fn release(&self) -> Result<()> {
        let pooled = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pooled) = pooled else {
            return Ok(());
        };
        match pooled.release().await {
            Err(JmsError::NotActive { pool, id }) => {
                debug!(pool = %pool, id, "Pool closed before {} was returned", self.what);
                Ok(())
            }
            other => other,
        }
    }
}
