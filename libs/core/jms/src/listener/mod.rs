//! Listener dispatch.
//!
//! - [`DestinationDescriptor`] and [`Concurrency`]: what to listen to and how
//!   many callbacks may run at once
//! - [`DispatchExecutor`]: bounded core/max worker pool per listener
//! - [`MessageListener`], [`SuccessHandler`], [`ErrorHandler`],
//!   [`HandlerChain`]: the callback and the policy around it
//! - [`Listener`]: `Registered -> Running -> Stopped`
//! - [`ListenerRegistry`]: coordinated shutdown

mod container;
mod descriptor;
mod dispatch;
mod handler;
mod registry;

pub use container::{Listener, ListenerState};
pub use descriptor::{Concurrency, DestinationDescriptor};
pub use dispatch::{DispatchExecutor, Task};
pub use handler::{
    listener_fn, AcknowledgingSuccessHandler, ErrorHandler, FnListener, HandlerChain, LoggingErrorHandler,
    MessageListener, SuccessHandler, TransactionalErrorHandler, TransactionalSuccessHandler,
};
pub use registry::ListenerRegistry;
