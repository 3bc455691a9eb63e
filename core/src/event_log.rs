//! Append-only audit log.
//!
//! The event log records what happened, in the order it was appended. Entries are
//! never mutated or deleted through this trait and nothing reads them back to make
//! a control decision: the log exists for observability and reconciliation only.
//! Retention and eviction are the backend's concern.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Position of an entry in the log (1-based, strictly increasing).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(u64);

impl Sequence {
    /// Create a sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors that can occur during event log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventLogError {
    /// Backend is unreachable or rejected the operation.
    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EventLogError {
    /// Whether retrying the same append could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Boxed future returned by [`EventLog`] operations.
pub type EventLogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventLogError>> + Send + 'a>>;

/// Append-only log of entries of type `E`.
///
/// # Dyn Compatibility
///
/// Like [`DocumentStore`](crate::document::DocumentStore), operations return boxed
/// futures so `Arc<dyn EventLog<E>>` can be moved into detached effects.
pub trait EventLog<E>: Send + Sync {
    /// Append an entry at the end of the log.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Unavailable`] if the backend rejected the write.
    fn append(&self, entry: E) -> EventLogFuture<'_, Sequence>;

    /// The last `limit` entries in append order (oldest first).
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Unavailable`] if the backend cannot be read.
    fn tail(&self, limit: usize) -> EventLogFuture<'_, Vec<E>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_orders_and_displays() {
        assert!(Sequence::new(2) > Sequence::new(1));
        assert_eq!(Sequence::new(7).to_string(), "#7");
        assert_eq!(Sequence::new(7).value(), 7);
    }

    #[test]
    fn only_unavailable_backends_are_transient() {
        assert!(EventLogError::Unavailable("timeout".into()).is_transient());
        assert!(!EventLogError::Serialization("bad entry".into()).is_transient());
    }
}
