//! Error Module

use std::fmt;
use thiserror::Error;

/// Returned by a send on a channel that is (or becomes) closed. The value that could not be
/// delivered is handed back to the caller.
///
/// Like crossbeam's `SendError`, `Debug` is implemented by hand so the payload does not need to
/// implement `Debug` itself.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClosedError<T>(pub T);

impl<T> ClosedError<T> {
    /// Unwraps the value that could not be sent.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for ClosedError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClosedError { .. }")
    }
}

impl<T> fmt::Display for ClosedError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a closed channel")
    }
}

impl<T: Send> std::error::Error for ClosedError<T> {}

/// Returned by `close()` on a channel that was already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("close of a closed channel")]
pub struct AlreadyClosedError;

/// Returned by `recv()` once the channel is closed and no sender is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("receiving on a closed channel")]
pub struct RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// No sender was waiting.
    #[error("receiving on an empty channel")]
    Empty,
    #[error("receiving on a closed channel")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvTimeoutError {
    #[error("timed out waiting on channel")]
    Timeout,
    #[error("receiving on a closed channel")]
    Closed,
    /// The timer thread backing the timeout could not be started.
    #[error("timer thread unavailable: {0:?}")]
    Timer(std::io::ErrorKind),
}

/// Returned by `try_send()`. Both variants hand the value back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No receiver was waiting to take the value.
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("no receiver waiting on channel"),
            TrySendError::Closed(_) => f.write_str("sending on a closed channel"),
        }
    }
}

impl<T: Send> std::error::Error for TrySendError<T> {}

impl<T> From<ClosedError<T>> for TrySendError<T> {
    fn from(e: ClosedError<T>) -> TrySendError<T> {
        TrySendError::Closed(e.0)
    }
}

/// A select that can never complete.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SelectError<T> {
    /// Every send case targets a closed channel and there was nothing else to wait for. `index`
    /// is the case that gave up last; its value is handed back.
    Closed { index: usize, value: T },
    /// The select had no cases and no default. Nothing could ever wake it up.
    Deadlock,
}

impl<T> SelectError<T> {
    /// Case index of the failed send, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            SelectError::Closed { index, .. } => Some(*index),
            SelectError::Deadlock => None,
        }
    }
}

impl<T> fmt::Debug for SelectError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::Closed { index, .. } => f
                .debug_struct("Closed")
                .field("index", index)
                .finish_non_exhaustive(),
            SelectError::Deadlock => f.write_str("Deadlock"),
        }
    }
}

impl<T> fmt::Display for SelectError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::Closed { index, .. } => {
                write!(f, "select case {} is sending on a closed channel", index)
            }
            SelectError::Deadlock => f.write_str("select with no cases blocks forever"),
        }
    }
}

impl<T: Send> std::error::Error for SelectError<T> {}
