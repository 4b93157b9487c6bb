//! Application callbacks and the success/error handler chains around them.

use super::DestinationDescriptor;
use crate::error::{BoxError, JmsError, Result};
use crate::message::Message;
use crate::protocol::{AcknowledgeMode, Session};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Application callback invoked for every delivered message.
///
/// # Example
///
/// ```rust,ignore
/// struct OrderListener;
///
/// #[async_trait]
/// impl MessageListener for OrderListener {
///     async fn on_message(&self, message: &Message) -> Result<(), BoxError> {
///         let order: Order = DefaultSerializer::from_message(message)?;
///         process(order).await
///     }
///
///     fn name(&self) -> &str {
///         "order-listener"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Handle one message. An `Err` routes the message to the error chain.
    async fn on_message(&self, message: &Message) -> std::result::Result<(), BoxError>;

    /// Name used in logs and metrics.
    fn name(&self) -> &str {
        "listener"
    }
}

/// Adapter returned by [`listener_fn`].
pub struct FnListener<F> {
    name: String,
    f: F,
}

/// Wrap an async closure taking an owned message as a [`MessageListener`].
pub fn listener_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn MessageListener>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    Arc::new(FnListener {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> MessageListener for FnListener<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
{
    async fn on_message(&self, message: &Message) -> std::result::Result<(), BoxError> {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs after the callback succeeded.
#[async_trait]
pub trait SuccessHandler: Send + Sync {
    /// An `Err` stops the success chain and routes the message to the error chain.
    async fn handle(&self, session: &dyn Session, message: &Message) -> Result<()>;
}

/// Runs after the callback or a success handler failed.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, session: &dyn Session, message: &Message, error: &JmsError) -> Result<()>;
}

/// Acknowledges the message (client acknowledgement).
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgingSuccessHandler;

#[async_trait]
impl SuccessHandler for AcknowledgingSuccessHandler {
    async fn handle(&self, session: &dyn Session, message: &Message) -> Result<()> {
        session.acknowledge(message).await.map_err(|e| {
            error!(
                message_id = %message.id,
                error = %e,
                "Acknowledgement failed after successful processing; the message may be redelivered"
            );
            JmsError::AcknowledgementFailed {
                message_id: message.id.clone(),
                reason: e.to_string(),
            }
        })
    }
}

/// Commits the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionalSuccessHandler;

#[async_trait]
impl SuccessHandler for TransactionalSuccessHandler {
    async fn handle(&self, session: &dyn Session, message: &Message) -> Result<()> {
        session.commit().await.map_err(|e| {
            error!(message_id = %message.id, error = %e, "Commit failed");
            JmsError::CommitFailed(e.to_string())
        })
    }
}

/// Rolls the session back.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionalErrorHandler;

#[async_trait]
impl ErrorHandler for TransactionalErrorHandler {
    async fn handle(&self, session: &dyn Session, message: &Message, _error: &JmsError) -> Result<()> {
        session.rollback().await.map_err(|e| {
            error!(message_id = %message.id, error = %e, "Rollback failed");
            JmsError::RollbackFailed(e.to_string())
        })
    }
}

/// Logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle(&self, _session: &dyn Session, message: &Message, error: &JmsError) -> Result<()> {
        warn!(
            message_id = %message.id,
            destination = ?message.destination,
            category = %error.category(),
            error = %error,
            "Message processing failed"
        );
        Ok(())
    }
}

/// Ordered success and error handlers.
///
/// Handlers run in registration order. Listeners put the handlers derived
/// from their descriptor first and append per-binding handlers after them.
#[derive(Clone, Default)]
pub struct HandlerChain {
    success: Vec<Arc<dyn SuccessHandler>>,
    error: Vec<Arc<dyn ErrorHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default policy for a binding: acknowledge under client
    /// acknowledgement, commit/rollback when transacted, always log failures.
    pub fn for_descriptor(descriptor: &DestinationDescriptor) -> Self {
        let mut chain = Self::new();
        if descriptor.is_transacted() {
            chain = chain
                .with_success_handler(TransactionalSuccessHandler)
                .with_error_handler(TransactionalErrorHandler);
        } else if descriptor.acknowledge_mode() == AcknowledgeMode::Client {
            chain = chain.with_success_handler(AcknowledgingSuccessHandler);
        }
        chain.with_error_handler(LoggingErrorHandler)
    }

    pub fn with_success_handler(mut self, handler: impl SuccessHandler + 'static) -> Self {
        self.success.push(Arc::new(handler));
        self
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error.push(Arc::new(handler));
        self
    }

    pub fn push_success(&mut self, handler: Arc<dyn SuccessHandler>) {
        self.success.push(handler);
    }

    pub fn push_error(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error.push(handler);
    }

    /// Append `other`'s handlers after this chain's.
    pub fn extend(mut self, other: HandlerChain) -> Self {
        self.success.extend(other.success);
        self.error.extend(other.error);
        self
    }

    pub fn success_len(&self) -> usize {
        self.success.len()
    }

    pub fn error_len(&self) -> usize {
        self.error.len()
    }

    /// Run success handlers in order, stopping at the first failure.
    pub async fn on_success(&self, session: &dyn Session, message: &Message) -> Result<()> {
        for handler in &self.success {
            handler.handle(session, message).await?;
        }
        Ok(())
    }

    /// Run every error handler in order. A failing handler is logged and the
    /// rest still run.
    pub async fn on_error(&self, session: &dyn Session, message: &Message, error: &JmsError) {
        for handler in &self.error {
            if let Err(e) = handler.handle(session, message, error).await {
                debug!(message_id = %message.id, error = %e, "Error handler failed");
            }
        }
    }
}
