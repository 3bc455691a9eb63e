//! # Vending Testing
//!
//! Testing utilities and helpers for the vending allocation core.
//!
//! This crate provides:
//! - Deterministic clocks
//! - Fault-injecting document stores and event logs
//! - The [`ReducerTest`] given/when/then harness and effect assertions
//!
//! ## Example
//!
//! ```ignore
//! use vending_testing::{ConflictingDocumentStore, test_clock};
//!
//! #[tokio::test]
//! async fn reservation_survives_contention() {
//!     let store = ConflictingDocumentStore::new(fresh_machine_document(), 3);
//!     let machine = MachineStore::new(store, layout, test_clock());
//!
//!     let rows = machine.reserve(&order_id, 2).await.unwrap();
//!     assert_eq!(rows.len(), 2);
//! }
//! ```

use chrono::{DateTime, Utc};
use vending_core::environment::Clock;

pub mod stores;

pub use reducer_test::{ReducerTest, assertions};
pub use stores::{
    ConflictingDocumentStore, DelayingDocumentStore, FailingDocumentStore, FailingEventLog,
};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use vending_testing::mocks::FixedClock;
    /// use vending_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
/// Honours `RUST_LOG`, defaulting to `debug`.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .ok();
}

// Re-export commonly used items
pub use mocks::{FixedClock, epoch, test_clock};
