//! In-process backends for the document store and the event log.
//!
//! These are the backends of the single-machine deployment: one process owns the
//! machine document and its audit trail. They honour the same contracts a remote
//! backend would (version-checked swaps, append-only log), so the allocation code
//! cannot tell the difference.

use std::sync::Arc;
use tokio::sync::RwLock;
use vending_core::document::{
    DocumentFuture, DocumentPath, DocumentStore, DocumentStoreError, Version, Versioned,
};
use vending_core::event_log::{EventLog, EventLogFuture, Sequence};

/// Versioned document held in memory.
///
/// Cloning shares the underlying document.
#[derive(Debug, Clone)]
pub struct InMemoryDocumentStore<D> {
    path: DocumentPath,
    slot: Arc<RwLock<Versioned<D>>>,
}

impl<D> InMemoryDocumentStore<D> {
    /// Create a store holding `initial` at [`Version::INITIAL`].
    #[must_use]
    pub fn new(path: DocumentPath, initial: D) -> Self {
        Self {
            path,
            slot: Arc::new(RwLock::new(Versioned::new(Version::INITIAL, initial))),
        }
    }

    /// Current version without cloning the document.
    pub async fn version(&self) -> Version {
        self.slot.read().await.version
    }
}

impl<D: Default> InMemoryDocumentStore<D> {
    /// Create a store whose document has never been written.
    #[must_use]
    pub fn empty(path: DocumentPath) -> Self {
        Self::new(path, D::default())
    }
}

impl<D> DocumentStore<D> for InMemoryDocumentStore<D>
where
    D: Clone + Send + Sync + 'static,
{
    fn path(&self) -> &DocumentPath {
        &self.path
    }

    fn load(&self) -> DocumentFuture<'_, Versioned<D>> {
        Box::pin(async move { Ok(self.slot.read().await.clone()) })
    }

    fn compare_and_swap(&self, expected: Version, document: D) -> DocumentFuture<'_, Version> {
        Box::pin(async move {
            let mut slot = self.slot.write().await;
            if slot.version != expected {
                return Err(DocumentStoreError::Conflict {
                    path: self.path.clone(),
                    expected,
                    actual: slot.version,
                });
            }

            let next = slot.version.next();
            *slot = Versioned::new(next, document);
            Ok(next)
        })
    }
}

/// Append-only log held in memory.
///
/// Cloning shares the underlying log.
#[derive(Debug, Clone)]
pub struct InMemoryEventLog<E> {
    path: DocumentPath,
    entries: Arc<RwLock<Vec<E>>>,
}

impl<E> InMemoryEventLog<E> {
    /// Create an empty log.
    #[must_use]
    pub fn new(path: DocumentPath) -> Self {
        Self {
            path,
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Logical address of the log.
    #[must_use]
    pub const fn path(&self) -> &DocumentPath {
        &self.path
    }

    /// Number of entries appended so far.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing has been appended yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<E: Clone> InMemoryEventLog<E> {
    /// Every entry in append order.
    pub async fn entries(&self) -> Vec<E> {
        self.entries.read().await.clone()
    }
}

impl<E> EventLog<E> for InMemoryEventLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn append(&self, entry: E) -> EventLogFuture<'_, Sequence> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            entries.push(entry);
            Ok(Sequence::new(entries.len() as u64))
        })
    }

    fn tail(&self, limit: usize) -> EventLogFuture<'_, Vec<E>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            let start = entries.len().saturating_sub(limit);
            Ok(entries[start..].to_vec())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_swap_is_rejected_without_writing() {
        let store = InMemoryDocumentStore::new(DocumentPath::new("m/doc"), "a".to_string());

        let v1 = store
            .compare_and_swap(Version::INITIAL, "b".to_string())
            .await
            .unwrap();
        assert_eq!(v1, Version::new(1));

        let stale = store
            .compare_and_swap(Version::INITIAL, "c".to_string())
            .await;
        assert!(matches!(
            stale,
            Err(DocumentStoreError::Conflict { expected, actual, .. })
                if expected == Version::INITIAL && actual == Version::new(1)
        ));

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.document, "b");
        assert_eq!(store.version().await, Version::new(1));
    }

    #[tokio::test]
    async fn empty_store_starts_from_default() {
        let store: InMemoryDocumentStore<Vec<u8>> = InMemoryDocumentStore::empty(DocumentPath::new("m/empty"));
        let snapshot = store.load().await.unwrap();
        assert!(snapshot.document.is_empty());
        assert_eq!(snapshot.version, Version::INITIAL);
    }

    #[tokio::test]
    async fn log_assigns_increasing_sequences_and_tails() {
        let log = InMemoryEventLog::new(DocumentPath::new("m/logs"));
        for n in 1..=5_u32 {
            let seq = log.append(n).await.unwrap();
            assert_eq!(seq, Sequence::new(u64::from(n)));
        }

        assert_eq!(log.tail(2).await.unwrap(), vec![4, 5]);
        assert_eq!(log.tail(10).await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(log.len().await, 5);
        assert!(!log.is_empty().await);
    }
}
