//! Message bus abstraction for the resource gateway.
//!
//! The gateway treats the bus as an opaque collaborator: subscribe to a
//! subject and receive events through a handler, or send a request and
//! receive a single response through a callback. Both operations return
//! immediately; delivery happens on bus driver tasks. The cache never
//! blocks a worker on bus I/O.
//!
//! [`NatsBus`] is the production implementation over NATS Core. Tests
//! substitute their own [`Bus`] implementations.

pub mod nats;

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use nats::NatsBus;

/// Bus error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The request did not receive a response within its timeout.
    #[error("request timeout")]
    Timeout,

    /// No service is listening on the request subject.
    #[error("no responders on subject")]
    NoResponders,

    /// Connecting to the bus failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The bus connection is closed.
    #[error("connection closed")]
    Closed,

    /// Subscribing to a subject failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// A request could not be sent or its response could not be read.
    #[error("request failed: {0}")]
    Request(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Handler invoked once per message delivered on a subscription.
/// Receives the full subject and the raw payload.
pub type EventHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Handler invoked exactly once with the outcome of a request.
pub type ResponseHandler = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// Message bus client.
///
/// Implementations must not invoke handlers synchronously from within
/// `subscribe` or `request`.
pub trait Bus: Send + Sync + 'static {
    /// Subscribe to a subject. Subjects may use NATS-style wildcards
    /// (`*` for one token, terminal `>` for one or more).
    fn subscribe(&self, subject: &str, handler: EventHandler) -> Result<BusSubscription>;

    /// Send a request and deliver the response (or a timeout error)
    /// through the handler.
    fn request(&self, subject: &str, payload: Bytes, timeout: Duration, handler: ResponseHandler);
}

/// Handle to an active subscription. Unsubscribes when consumed with
/// [`BusSubscription::unsubscribe`] or when dropped.
pub struct BusSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl BusSubscription {
    /// Wrap a cancellation closure.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the subscription.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSubscription").finish_non_exhaustive()
    }
}
