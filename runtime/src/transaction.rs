//! Optimistic read-modify-write over a versioned document.
//!
//! [`transact`] loads the current `(version, document)`, hands the document to a
//! pure transform, and commits the transform's output with compare-and-swap. If
//! another writer committed in between, the swap fails with a conflict and the
//! transform is re-run against the fresh snapshot. The transform therefore must
//! be free of side effects: it may run any number of times per logical call.
//!
//! # Example
//!
//! ```rust
//! use vending_runtime::memory::InMemoryDocumentStore;
//! use vending_runtime::retry::RetryPolicy;
//! use vending_runtime::transaction::{Outcome, transact};
//! use vending_core::document::DocumentPath;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryDocumentStore::new(DocumentPath::new("counters/main"), 0_u64);
//!
//! let previous = transact(&store, &RetryPolicy::default(), |count: &u64| {
//!     Outcome::Commit { document: count + 1, value: *count }
//! })
//! .await?;
//!
//! assert_eq!(previous, 0);
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use thiserror::Error;
use vending_core::document::{DocumentPath, DocumentStore, DocumentStoreError, Version};

/// What a transform decided for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<D, T> {
    /// Swap `document` in and return `value` once the swap succeeds.
    Commit {
        /// Replacement document
        document: D,
        /// Result handed back to the caller on commit
        value: T,
    },
    /// Leave the document untouched and return `value` immediately.
    ///
    /// Used for deterministic outcomes that need no write (an idempotent hit,
    /// a business-rule rejection).
    Abort(T),
}

/// Errors surfaced by [`transact`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Every attempt lost the compare-and-swap race.
    #[error("Gave up on {path} after {attempts} conflicting attempts")]
    Contention {
        /// Contended document
        path: DocumentPath,
        /// Attempts made (first attempt included)
        attempts: usize,
    },

    /// The store failed for a reason other than a version conflict.
    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

impl TransactionError {
    /// Whether running the transaction again could succeed.
    ///
    /// A document that does not (de)serialize fails the same way every time.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Store(DocumentStoreError::Serialization(_)))
    }
}

/// Run `transform` as an atomic read-modify-write against `store`.
///
/// Conflicts are retried according to `policy`; they are invisible to the caller
/// unless every attempt conflicts.
///
/// # Errors
///
/// - [`TransactionError::Contention`]: `policy.max_attempts()` attempts all conflicted
/// - [`TransactionError::Store`]: loading or swapping failed for another reason
#[tracing::instrument(skip(store, policy, transform), fields(path = %store.path()))]
pub async fn transact<S, D, T, F>(
    store: &S,
    policy: &RetryPolicy,
    mut transform: F,
) -> Result<T, TransactionError>
where
    S: DocumentStore<D> + ?Sized,
    F: FnMut(&D) -> Outcome<D, T>,
{
    let mut attempt = 0;

    loop {
        let snapshot = store.load().await?;
        let read_version: Version = snapshot.version;

        let (document, value) = match transform(&snapshot.document) {
            Outcome::Abort(value) => {
                tracing::debug!(version = %read_version, "Transaction aborted without writing");
                return Ok(value);
            },
            Outcome::Commit { document, value } => (document, value),
        };

        match store.compare_and_swap(read_version, document).await {
            Ok(committed) => {
                if attempt > 0 {
                    metrics::counter!("transaction.committed_after_conflict").increment(1);
                }
                tracing::debug!(version = %committed, attempt, "Transaction committed");
                return Ok(value);
            },
            Err(error) if error.is_conflict() => {
                metrics::counter!("transaction.conflicts").increment(1);

                if attempt >= policy.max_retries {
                    tracing::error!(attempt, error = %error, "Transaction gave up after repeated conflicts");
                    return Err(TransactionError::Contention {
                        path: store.path().clone(),
                        attempts: attempt + 1,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_us = delay.as_micros(),
                    error = %error,
                    "Concurrent write detected, re-running transform"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            },
            Err(error) => return Err(error.into()),
        }
    }
}
