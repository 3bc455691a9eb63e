//! Versioned documents and the store abstraction that guards them.
//!
//! A document is a single value (for example the whole state of one vending
//! machine) that every writer replaces atomically. Writers never mutate it in
//! place: they read a `(Version, document)` pair, compute a new document, and
//! ask the store to swap it in *only if* the version is still the one they read.
//! A stale version is reported as [`DocumentStoreError::Conflict`] and the
//! caller re-runs its transform against the fresh snapshot.
//!
//! # Example
//!
//! ```no_run
//! use vending_core::document::{DocumentStore, DocumentStoreError};
//!
//! async fn bump<S: DocumentStore<u64>>(store: &S) -> Result<(), DocumentStoreError> {
//!     loop {
//!         let current = store.load().await?;
//!         match store
//!             .compare_and_swap(current.version, current.document + 1)
//!             .await
//!         {
//!             Ok(_) => return Ok(()),
//!             Err(DocumentStoreError::Conflict { .. }) => continue,
//!             Err(other) => return Err(other),
//!         }
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `DocumentPath` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid document path: {0}")]
pub struct ParseDocumentPathError(String);

/// Logical address of a document, e.g. `"vending/machine1"`.
///
/// - `FromStr::from_str()`: Validates input (rejects empty or slash-delimited-empty paths)
/// - `new()`: No validation (for application-controlled constants)
///
/// # Examples
///
/// ```
/// use vending_core::document::DocumentPath;
///
/// let path = DocumentPath::new("vending/machine1");
/// assert_eq!(path.as_str(), "vending/machine1");
///
/// let parsed: DocumentPath = "vending/machine2".parse().unwrap();
/// assert_eq!(parsed.segments().count(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Create a new `DocumentPath` from a string.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Get the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments of the path.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Path of a child document (e.g. `vending/machine1/logs`).
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}/{segment}", self.0))
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentPath {
    type Err = ParseDocumentPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Err(ParseDocumentPathError(
                "Document path cannot be empty".to_string(),
            ));
        }
        if trimmed.split('/').any(str::is_empty) {
            return Err(ParseDocumentPathError(format!(
                "Document path '{s}' contains an empty segment"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl AsRef<str> for DocumentPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Document version number for optimistic concurrency control.
///
/// Versions start at 0 (document never written) and increase by exactly one for
/// every successful compare-and-swap.
///
/// # Examples
///
/// ```
/// use vending_core::document::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a document that has never been written.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A document together with the version it was read at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<D> {
    /// Version the document was read at
    pub version: Version,
    /// The document value
    pub document: D,
}

impl<D> Versioned<D> {
    /// Pair a document with its version.
    #[must_use]
    pub const fn new(version: Version, document: D) -> Self {
        Self { version, document }
    }
}

/// Errors that can occur during document store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentStoreError {
    /// Optimistic concurrency conflict: another writer committed first.
    ///
    /// This is transient. Re-read the document and re-run the transform.
    #[error("Concurrency conflict on {path}: expected {expected}, found {actual}")]
    Conflict {
        /// Path of the contended document
        path: DocumentPath,
        /// The version the writer read
        expected: Version,
        /// The version currently stored
        actual: Version,
    },

    /// Backend is unreachable or rejected the operation.
    #[error("Document store unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DocumentStoreError {
    /// Whether this error is a version conflict (safe to retry with a fresh read).
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Boxed future returned by [`DocumentStore`] operations.
pub type DocumentFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, DocumentStoreError>> + Send + 'a>>;

/// Store for a single versioned document.
///
/// # Compare-and-swap
///
/// [`compare_and_swap`](DocumentStore::compare_and_swap) replaces the document only
/// when the stored version equals `expected`. On success it returns the new version
/// (`expected.next()`); otherwise it returns [`DocumentStoreError::Conflict`] and
/// leaves the stored document untouched. There is no blind write: last-writer-wins
/// is not expressible through this trait.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so that `Arc<dyn DocumentStore<D>>` can be captured by effects.
pub trait DocumentStore<D>: Send + Sync {
    /// Logical address of the document.
    fn path(&self) -> &DocumentPath;

    /// Read the current document and its version.
    ///
    /// A document that has never been written is returned as its default
    /// value at [`Version::INITIAL`].
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Unavailable`] if the backend cannot be read.
    fn load(&self) -> DocumentFuture<'_, Versioned<D>>;

    /// Replace the document if it is still at `expected`.
    ///
    /// # Errors
    ///
    /// - [`DocumentStoreError::Conflict`]: another writer committed since `expected`
    /// - [`DocumentStoreError::Unavailable`]: the backend rejected the write
    fn compare_and_swap(&self, expected: Version, document: D) -> DocumentFuture<'_, Version>;
}
