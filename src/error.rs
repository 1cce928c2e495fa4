//!
//! Errors returned by every fallible operation of the client, plus the per-thread
//! last-error slot queried through [`errmsg`].
//!
use std::cell::RefCell;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to create object: {0}")]
    Creation(String),

    #[error("Topic resolution failed: {0}")]
    Resolution(String),

    #[error("Send would block, flow control window is full")]
    WouldBlock,

    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

thread_local! {
    static LAST_ERROR: RefCell<String> = RefCell::new(String::new());
}

/// Description of the most recent failure returned on the calling thread.
///
/// Returns an empty string if nothing has failed on this thread yet. The slot is
/// overwritten by the next failing call, so query it right after the failure.
pub fn errmsg() -> String {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Records the error of a failed result in the last-error slot and hands the result back.
pub(crate) fn track<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = e.to_string());
    }
    result
}
