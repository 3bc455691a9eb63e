//! Fault-injecting storage doubles.
//!
//! Each double either wraps a real backend and perturbs it, or fails outright,
//! so tests can exercise the conflict-retry path and the best-effort side
//! channels without timing tricks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use vending_core::document::{
    DocumentFuture, DocumentPath, DocumentStore, DocumentStoreError, Version, Versioned,
};
use vending_core::event_log::{EventLog, EventLogError, EventLogFuture, Sequence};

/// Wraps a document store and rejects the first `n` swaps with a conflict.
///
/// The rejected swaps never reach the inner store, as if another writer had
/// committed first.
#[derive(Debug)]
pub struct ConflictingDocumentStore<S> {
    inner: S,
    remaining: AtomicUsize,
    injected: AtomicUsize,
}

impl<S> ConflictingDocumentStore<S> {
    /// Wrap `inner`, injecting `conflicts` conflicts before delegating.
    #[must_use]
    pub const fn new(inner: S, conflicts: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(conflicts),
            injected: AtomicUsize::new(0),
        }
    }

    /// Number of conflicts returned so far.
    #[must_use]
    pub fn conflicts_injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    fn take_conflict(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<D, S> DocumentStore<D> for ConflictingDocumentStore<S>
where
    S: DocumentStore<D>,
{
    fn path(&self) -> &DocumentPath {
        self.inner.path()
    }

    fn load(&self) -> DocumentFuture<'_, Versioned<D>> {
        self.inner.load()
    }

    fn compare_and_swap(&self, expected: Version, document: D) -> DocumentFuture<'_, Version> {
        if self.take_conflict() {
            self.injected.fetch_add(1, Ordering::SeqCst);
            let path = self.inner.path().clone();
            return Box::pin(async move {
                Err(DocumentStoreError::Conflict {
                    path,
                    expected,
                    actual: expected.next(),
                })
            });
        }

        self.inner.compare_and_swap(expected, document)
    }
}

/// Wraps a document store and holds back swaps of matching documents.
///
/// A held swap still carries the version it read, so anything committed while
/// it waits turns it into a conflict.
pub struct DelayingDocumentStore<S, D> {
    inner: S,
    delay: Duration,
    matches: Box<dyn Fn(&D) -> bool + Send + Sync>,
    delayed: AtomicUsize,
}

impl<S, D> DelayingDocumentStore<S, D> {
    /// Wrap `inner`, delaying every swap whose new document satisfies `matches`.
    #[must_use]
    pub fn new(inner: S, delay: Duration, matches: impl Fn(&D) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner,
            delay,
            matches: Box::new(matches),
            delayed: AtomicUsize::new(0),
        }
    }

    /// Number of swaps held back so far.
    #[must_use]
    pub fn swaps_delayed(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S, D> std::fmt::Debug for DelayingDocumentStore<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayingDocumentStore")
            .field("delay", &self.delay)
            .field("delayed", &self.swaps_delayed())
            .finish_non_exhaustive()
    }
}

impl<D, S> DocumentStore<D> for DelayingDocumentStore<S, D>
where
    S: DocumentStore<D>,
    D: Send + 'static,
{
    fn path(&self) -> &DocumentPath {
        self.inner.path()
    }

    fn load(&self) -> DocumentFuture<'_, Versioned<D>> {
        self.inner.load()
    }

    fn compare_and_swap(&self, expected: Version, document: D) -> DocumentFuture<'_, Version> {
        if !(self.matches)(&document) {
            return self.inner.compare_and_swap(expected, document);
        }

        self.delayed.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            self.inner.compare_and_swap(expected, document).await
        })
    }
}

/// Document store whose every operation fails with `Unavailable`.
#[derive(Debug, Clone)]
pub struct FailingDocumentStore {
    path: DocumentPath,
}

impl FailingDocumentStore {
    /// Create a store that is permanently unreachable.
    #[must_use]
    pub const fn new(path: DocumentPath) -> Self {
        Self { path }
    }
}

impl<D> DocumentStore<D> for FailingDocumentStore {
    fn path(&self) -> &DocumentPath {
        &self.path
    }

    fn load(&self) -> DocumentFuture<'_, Versioned<D>> {
        Box::pin(async move {
            Err(DocumentStoreError::Unavailable(format!(
                "injected failure loading {}",
                self.path
            )))
        })
    }

    fn compare_and_swap(&self, _expected: Version, _document: D) -> DocumentFuture<'_, Version> {
        Box::pin(async move {
            Err(DocumentStoreError::Unavailable(format!(
                "injected failure writing {}",
                self.path
            )))
        })
    }
}

/// Event log that fails the first `n` appends, then records entries.
#[derive(Debug)]
pub struct FailingEventLog<E> {
    remaining_failures: AtomicUsize,
    attempts: AtomicUsize,
    failure: EventLogError,
    entries: Mutex<Vec<E>>,
}

impl<E> FailingEventLog<E> {
    /// Fail the first `failures` appends as if the backend were unreachable.
    #[must_use]
    pub fn failing_first(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            failure: EventLogError::Unavailable("injected append failure".to_string()),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Fail every append.
    #[must_use]
    pub fn always() -> Self {
        Self::failing_first(usize::MAX)
    }

    /// Reject every append as an entry that cannot be encoded.
    #[must_use]
    pub fn rejecting() -> Self {
        Self {
            failure: EventLogError::Serialization("injected encoding failure".to_string()),
            ..Self::always()
        }
    }

    /// Appends attempted, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<E: Clone> FailingEventLog<E> {
    /// Entries that were accepted.
    #[must_use]
    pub fn entries(&self) -> Vec<E> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<E> EventLog<E> for FailingEventLog<E>
where
    E: Clone + Send + Sync,
{
    fn append(&self, entry: E) -> EventLogFuture<'_, Sequence> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if failed {
            Err(self.failure.clone())
        } else {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.push(entry);
            Ok(Sequence::new(entries.len() as u64))
        };

        Box::pin(async move { result })
    }

    fn tail(&self, limit: usize) -> EventLogFuture<'_, Vec<E>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let start = entries.len().saturating_sub(limit);
        let tail = entries[start..].to_vec();
        Box::pin(async move { Ok(tail) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Bare versioned `u32` cell
    struct CounterStore {
        path: DocumentPath,
        cell: Mutex<(Version, u32)>,
    }

    fn counter_store() -> CounterStore {
        CounterStore {
            path: DocumentPath::new("t/counter"),
            cell: Mutex::new((Version::INITIAL, 0)),
        }
    }

    impl DocumentStore<u32> for CounterStore {
        fn path(&self) -> &DocumentPath {
            &self.path
        }

        fn load(&self) -> DocumentFuture<'_, Versioned<u32>> {
            let (version, document) = *self.cell.lock().unwrap();
            Box::pin(async move { Ok(Versioned { version, document }) })
        }

        fn compare_and_swap(&self, expected: Version, document: u32) -> DocumentFuture<'_, Version> {
            let mut cell = self.cell.lock().unwrap();
            let result = if cell.0 == expected {
                *cell = (expected.next(), document);
                Ok(cell.0)
            } else {
                Err(DocumentStoreError::Conflict {
                    path: self.path.clone(),
                    expected,
                    actual: cell.0,
                })
            };
            Box::pin(async move { result })
        }
    }

    #[tokio::test]
    async fn failing_log_recovers_after_configured_failures() {
        let log = FailingEventLog::failing_first(2);

        assert!(log.append("a").await.is_err());
        assert!(log.append("b").await.is_err());
        assert_eq!(log.append("c").await.unwrap(), Sequence::new(1));

        assert_eq!(log.attempts(), 3);
        assert_eq!(log.entries(), vec!["c"]);
        assert_eq!(log.tail(5).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn always_failing_log_accepts_nothing() {
        let log = FailingEventLog::<u8>::always();
        for n in 0..10 {
            assert!(log.append(n).await.is_err());
        }
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn rejecting_log_reports_a_permanent_failure() {
        let log = FailingEventLog::<u8>::rejecting();
        let error = log.append(1).await.unwrap_err();
        assert!(!error.is_transient());
        assert_eq!(log.attempts(), 1);
    }

    #[tokio::test]
    async fn delayed_swap_conflicts_with_a_write_made_while_it_waits() {
        let store = std::sync::Arc::new(DelayingDocumentStore::new(
            counter_store(),
            Duration::from_millis(50),
            |n: &u32| *n == 100,
        ));

        let held = {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move { store.compare_and_swap(Version::INITIAL, 100).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.compare_and_swap(Version::INITIAL, 1).await.unwrap(), Version::new(1));

        assert!(held.await.unwrap().unwrap_err().is_conflict());
        assert_eq!(store.swaps_delayed(), 1);
        assert_eq!(store.load().await.unwrap().document, 1);
    }

    #[tokio::test]
    async fn failing_store_reports_unavailable() {
        let store = FailingDocumentStore::new(DocumentPath::new("m/down"));
        let loaded: Result<Versioned<u8>, _> = store.load().await;
        assert!(matches!(loaded, Err(DocumentStoreError::Unavailable(_))));
    }
}
