//!
//! Process-wide diagnostic sink.
//!
//! Engine diagnostics are emitted as `tracing` events and, when a callback has been
//! installed, handed to that callback synchronously on whichever thread produced them.
//! Install the callback before creating any [`Context`](crate::context::Context); the
//! callback must return quickly since the emitting dispatch thread waits for it.
//!
use crate::callback::CallbackResult;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Emergency => "EMERGENCY",
            Severity::Alert => "ALERT",
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        };
        f.write_str(label)
    }
}

/// Receiver of engine diagnostics.
pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, text: &str) -> CallbackResult;
}

impl<F> LogSink for F
where
    F: Fn(Severity, &str) -> CallbackResult + Send + Sync,
{
    fn log(&self, severity: Severity, text: &str) -> CallbackResult {
        self(severity, text)
    }
}

static SINK: RwLock<Option<Arc<dyn LogSink>>> = RwLock::new(None);

/// Installs the process-wide logger callback, replacing any previous one.
pub fn install<F>(sink: F)
where
    F: Fn(Severity, &str) -> CallbackResult + Send + Sync + 'static,
{
    install_sink(Arc::new(sink));
}

pub fn install_sink(sink: Arc<dyn LogSink>) {
    let mut guard = match SINK.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(sink);
}

/// Removes the installed logger callback. Diagnostics still reach `tracing`.
pub fn clear() {
    let mut guard = match SINK.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = None;
}

pub(crate) fn emit(severity: Severity, text: &str) {
    match severity {
        Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => {
            tracing::error!("{}", text)
        }
        Severity::Warning => tracing::warn!("{}", text),
        Severity::Notice | Severity::Info => tracing::info!("{}", text),
        Severity::Debug => tracing::debug!("{}", text),
    }

    // Clone out of the lock so a slow sink never blocks install/clear.
    let sink = match SINK.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    if let Some(sink) = sink {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.log(severity, text)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("logger callback reported failure: {}", e),
            Err(_) => tracing::debug!("logger callback panicked"),
        }
    }
}

pub(crate) fn warning(text: &str) {
    emit(Severity::Warning, text);
}

pub(crate) fn info(text: &str) {
    emit(Severity::Info, text);
}
