//! Tracks running listeners for coordinated shutdown.

use super::{HandlerChain, Listener, MessageListener};
use crate::config::ListenerConfig;
use crate::error::Result;
use crate::protocol::ConnectionFactory;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// All listeners started through it, in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<Listener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and start a listener against `factory` (usually a
    /// [`ConnectionPool`](crate::pool::ConnectionPool)).
    ///
    /// A failed start leaves the registry and the other listeners untouched.
    pub async fn register(
        &self,
        factory: &dyn ConnectionFactory,
        config: ListenerConfig,
        callback: Arc<dyn MessageListener>,
        handlers: HandlerChain,
    ) -> Result<Arc<Listener>> {
        let listener = Arc::new(Listener::new(config, callback, handlers));
        self.start(factory, listener).await
    }

    /// Start an already built listener and track it.
    pub async fn start(&self, factory: &dyn ConnectionFactory, listener: Arc<Listener>) -> Result<Arc<Listener>> {
        if let Err(e) = listener.start(factory).await {
            warn!(listener = %listener.name(), error = %e, "Listener registration failed");
            return Err(e);
        }
        self.lock().push(listener.clone());
        Ok(listener)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.lock().clone()
    }

    /// Stop every listener and forget them.
    ///
    /// A listener that does not stop cleanly is logged and the rest are still
    /// stopped. Returns `true` when all of them stopped cleanly.
    pub async fn shutdown(&self) -> bool {
        let listeners = std::mem::take(&mut *self.lock());
        let total = listeners.len();
        let mut clean = 0;
        for listener in listeners {
            if listener.stop().await {
                clean += 1;
            } else {
                warn!(listener = %listener.name(), id = %listener.id(), "Listener did not stop cleanly");
            }
        }
        info!(total, clean, "Listener registry shut down");
        clean == total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
