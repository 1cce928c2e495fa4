//!
//! Callback contracts invoked by the dispatch threads, and the binding that ties a
//! callback implementation to the object that owns it.
//!
//! Application state travels inside the implementation itself, either captured by a
//! closure or held as fields of a type implementing one of the traits below.
//!
use crate::logger;
use crate::message::Message;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Status returned by every application callback.
pub type CallbackResult = Result<(), CallbackError>;

/// Delivery target of a [`Receiver`](crate::receiver::Receiver).
pub trait Deliverable: Send + Sync {
    fn deliver(&self, message: &Message<'_>) -> CallbackResult;
}

impl<F> Deliverable for F
where
    F: Fn(&Message<'_>) -> CallbackResult + Send + Sync,
{
    fn deliver(&self, message: &Message<'_>) -> CallbackResult {
        self(message)
    }
}

/// Transition of a remote receiver as seen by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent<'a> {
    Connect { receiver: &'a str },
    Disconnect { receiver: &'a str },
}

impl<'a> SourceEvent<'a> {
    pub fn receiver(&self) -> &'a str {
        match *self {
            SourceEvent::Connect { receiver } | SourceEvent::Disconnect { receiver } => receiver,
        }
    }
}

pub trait SourceEventHandler: Send + Sync {
    fn on_event(&self, event: &SourceEvent<'_>) -> CallbackResult;
}

impl<F> SourceEventHandler for F
where
    F: Fn(&SourceEvent<'_>) -> CallbackResult + Send + Sync,
{
    fn on_event(&self, event: &SourceEvent<'_>) -> CallbackResult {
        self(event)
    }
}

/// Called once per newly discovered (topic, source) pair.
pub trait SourceNotifier: Send + Sync {
    fn on_new_source(&self, topic: &str, source: &str) -> CallbackResult;
}

impl<F> SourceNotifier for F
where
    F: Fn(&str, &str) -> CallbackResult + Send + Sync,
{
    fn on_new_source(&self, topic: &str, source: &str) -> CallbackResult {
        self(topic, source)
    }
}

/// A callback implementation bound to the object that owns it.
///
/// Dispatch tasks hold their own clone of the binding, so the handler stays alive until
/// the owning object's delete has joined the task that invokes it.
pub struct CallbackBinding<H: ?Sized> {
    owner: Arc<str>,
    handler: Arc<H>,
}

impl<H: ?Sized> Clone for CallbackBinding<H> {
    fn clone(&self) -> Self {
        Self {
            owner: Arc::clone(&self.owner),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<H: ?Sized> CallbackBinding<H> {
    pub fn new(owner: impl Into<Arc<str>>, handler: Arc<H>) -> Self {
        Self {
            owner: owner.into(),
            handler,
        }
    }

    /// Identifier of the object the callback is bound to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Runs `call` against the handler. A returned error or a panic is reported to the
    /// logger and swallowed; it never unwinds into the dispatch machinery.
    pub(crate) fn invoke<F>(&self, call: F) -> bool
    where
        F: FnOnce(&H) -> CallbackResult,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| call(&self.handler))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                logger::warning(&format!("callback of {} returned an error: {}", self.owner, e));
                false
            }
            Err(_) => {
                logger::emit(
                    logger::Severity::Error,
                    &format!("callback of {} panicked", self.owner),
                );
                false
            }
        }
    }
}
