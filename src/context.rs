//!
//! The messaging domain handle.
//!
//! A [`Context`] owns the dispatch threads that run every callback of the sources and
//! receivers bound to it, and the resolver that matches them by topic. Delete sources
//! and receivers first; deleting a context that still has bound objects fails.
//!
use crate::callback::{CallbackBinding, SourceNotifier};
use crate::config::ContextAttribute;
use crate::error::{self, ClientError};
use crate::logger;
use crate::resolver::Resolver;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

/// Generate the next process-wide object identifier.
pub(crate) fn next_id() -> u64 {
    static SEQUENCE: AtomicU64 = AtomicU64::new(1);
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// True when called from inside a tokio runtime, where blocking joins would panic or
/// deadlock the dispatch threads.
pub(crate) fn in_async_context() -> bool {
    Handle::try_current().is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Source,
    Receiver,
}

#[derive(Debug, Default)]
struct Lifecycle {
    deleted: bool,
    sources: usize,
    receivers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    sources_notified: AtomicU64,
}

/// Point-in-time counters of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub sources: usize,
    pub receivers: usize,
    pub topics: usize,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub sources_notified: u64,
}

/// State shared between a context and everything bound to it.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) handle: Handle,
    pub(crate) resolver: Resolver,
    pub(crate) send_window: usize,
    pub(crate) delivery_queue: usize,
    notifier: Option<CallbackBinding<dyn SourceNotifier>>,
    lifecycle: Mutex<Lifecycle>,
    counters: Counters,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<(), ClientError> {
        if self.lifecycle().deleted {
            return Err(ClientError::Lifecycle(format!("context `{}` is deleted", self.name)));
        }
        Ok(())
    }

    /// Counts a new source or receiver against the context, unless it is deleted.
    pub(crate) fn attach(&self, endpoint: Endpoint) -> Result<(), ClientError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.deleted {
            return Err(ClientError::Creation(format!("context `{}` is deleted", self.name)));
        }
        match endpoint {
            Endpoint::Source => lifecycle.sources += 1,
            Endpoint::Receiver => lifecycle.receivers += 1,
        }
        Ok(())
    }

    pub(crate) fn detach(&self, endpoint: Endpoint) {
        let mut lifecycle = self.lifecycle();
        match endpoint {
            Endpoint::Source => lifecycle.sources = lifecycle.sources.saturating_sub(1),
            Endpoint::Receiver => lifecycle.receivers = lifecycle.receivers.saturating_sub(1),
        }
    }

    /// Reports a (topic, source) pair to the new-source notification callback the first
    /// time it becomes visible in this context.
    pub(crate) fn announce(&self, topic: &Arc<str>, source: &Arc<str>) {
        if !self.resolver.first_sighting(topic, source) {
            return;
        }
        self.counters.sources_notified.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = %self.name, topic = %topic, source = %source, "new source");

        if let Some(binding) = &self.notifier {
            let binding = binding.clone();
            let topic = Arc::clone(topic);
            let source = Arc::clone(source);
            self.handle.spawn(async move {
                tokio::task::block_in_place(|| binding.invoke(|notifier| notifier.on_new_source(&topic, &source)));
            });
        }
    }

    pub(crate) fn count_sent(&self) {
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_delivered(&self) {
        self.counters.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Context {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
    shutdown_timeout: Duration,
}

impl Context {
    /// Creates a context from a fully populated attribute, consuming it.
    ///
    /// # Errors
    /// Returns `ClientError::Creation` if the configuration is invalid or the dispatch
    /// threads cannot be started.
    pub fn create(attr: ContextAttribute) -> Result<Context, ClientError> {
        error::track(Self::build(attr))
    }

    fn build(attr: ContextAttribute) -> Result<Context, ClientError> {
        let config = attr.into_config()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.dispatch_threads)
            .thread_name(format!("{}-dispatch", config.name))
            .enable_all()
            .build()
            .map_err(|e| ClientError::Creation(format!("failed to start dispatch threads: {}", e)))?;

        let id = next_id();
        let notifier = config
            .notifier
            .map(|notifier| CallbackBinding::new(format!("context {}", config.name), notifier));
        let shared = Arc::new(Shared {
            id,
            handle: runtime.handle().clone(),
            resolver: Resolver::new(),
            send_window: config.send_window,
            delivery_queue: config.delivery_queue,
            notifier,
            lifecycle: Mutex::new(Lifecycle::default()),
            counters: Counters::default(),
            name: config.name,
        });

        logger::info(&format!(
            "context `{}` created with {} dispatch thread(s)",
            shared.name, config.dispatch_threads
        ));
        Ok(Context {
            shared,
            runtime: Mutex::new(Some(runtime)),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn stats(&self) -> ContextStats {
        let lifecycle = self.shared.lifecycle();
        let counters = &self.shared.counters;
        ContextStats {
            sources: lifecycle.sources,
            receivers: lifecycle.receivers,
            topics: self.shared.resolver.topic_count(),
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            messages_delivered: counters.messages_delivered.load(Ordering::Relaxed),
            sources_notified: counters.sources_notified.load(Ordering::Relaxed),
        }
    }

    /// Deletes the context and stops its dispatch threads.
    ///
    /// # Errors
    /// Returns `ClientError::Lifecycle` if any source or receiver is still bound, if
    /// the context was already deleted, or if called from inside an async runtime.
    pub fn delete(&self) -> Result<(), ClientError> {
        error::track(self.shutdown())
    }

    fn shutdown(&self) -> Result<(), ClientError> {
        if in_async_context() {
            return Err(ClientError::Lifecycle(
                "a context cannot be deleted from inside an async runtime".to_owned(),
            ));
        }
        {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.deleted {
                return Err(ClientError::Lifecycle(format!(
                    "context `{}` already deleted",
                    self.shared.name
                )));
            }
            if lifecycle.sources > 0 || lifecycle.receivers > 0 {
                return Err(ClientError::Lifecycle(format!(
                    "context `{}` still has {} source(s) and {} receiver(s) bound",
                    self.shared.name, lifecycle.sources, lifecycle.receivers
                )));
            }
            lifecycle.deleted = true;
        }

        if let Some(runtime) = self.take_runtime() {
            runtime.shutdown_timeout(self.shutdown_timeout);
        }
        logger::info(&format!("context `{}` deleted", self.shared.name));
        Ok(())
    }

    fn take_runtime(&self) -> Option<Runtime> {
        match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let bound = {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.deleted {
                return;
            }
            lifecycle.deleted = true;
            lifecycle.sources + lifecycle.receivers
        };
        if bound > 0 {
            logger::warning(&format!(
                "context `{}` dropped with {} bound object(s)",
                self.shared.name, bound
            ));
        }
        if let Some(runtime) = self.take_runtime() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}
