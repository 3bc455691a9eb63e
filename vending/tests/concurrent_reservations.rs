//! Integration tests for concurrent reservations against one machine document
//!
//! Many buyers confirm at once; every reservation runs its own
//! compare-and-swap loop over the same in-memory document.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use vending_core::document::{DocumentPath, DocumentStore};
use vending_machine::{
    AllocationFailure, MachineState, MachineStore, OrderId, OversizePolicy, ReserveError, RowId,
    RowLayout,
};
use vending_runtime::memory::InMemoryDocumentStore;
use vending_runtime::retry::RetryPolicy;
use vending_testing::{ConflictingDocumentStore, test_clock};

// ============================================================================
// Test Fixtures
// ============================================================================

fn contention_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(500)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(true)
        .build()
}

fn machine_over(document: Arc<dyn DocumentStore<MachineState>>) -> MachineStore {
    MachineStore::new(document, RowLayout::default(), Arc::new(test_clock()))
        .with_retry_policy(contention_policy())
}

fn fresh_document() -> Arc<InMemoryDocumentStore<MachineState>> {
    Arc::new(InMemoryDocumentStore::empty(DocumentPath::new("vending/machine1")))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_buyers_never_share_a_unit() {
    let machine = machine_over(fresh_document());

    let results = join_all((0..30).map(|n| {
        let machine = machine.clone();
        async move {
            let order_id = OrderId::new(format!("order_{n}"));
            (order_id.clone(), machine.reserve(&order_id, 1).await)
        }
    }))
    .await;

    let mut per_row: BTreeMap<RowId, u32> = BTreeMap::new();
    let mut reserved = 0;
    let mut exhausted = 0;
    for (order_id, result) in results {
        match result {
            Ok(reservation) => {
                assert_eq!(reservation.rows.len(), 1, "{order_id} got the wrong unit count");
                assert!(!reservation.replayed);
                *per_row.entry(reservation.rows[0]).or_default() += 1;
                reserved += 1;
            },
            Err(ReserveError::Allocation(AllocationFailure::RowsExhausted { .. })) => exhausted += 1,
            Err(other) => panic!("unexpected failure for {order_id}: {other}"),
        }
    }

    assert_eq!(reserved, 20);
    assert_eq!(exhausted, 10);
    assert!(per_row.values().all(|units| *units == 5), "uneven rows: {per_row:?}");

    let snapshot = machine.snapshot().await.unwrap();
    let state = snapshot.document;
    assert_eq!(state.orders.len(), 20);
    assert_eq!(state.allocated_units(), 20);
    assert!(state.rows.values().all(|row| row.remaining == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_replays_of_one_order_reserve_once() {
    let machine = machine_over(fresh_document());
    let order_id = OrderId::new("order_dup");

    let results = join_all((0..10).map(|_| {
        let machine = machine.clone();
        let order_id = order_id.clone();
        async move { machine.reserve(&order_id, 3).await.unwrap() }
    }))
    .await;

    let first = &results[0].rows;
    assert!(results.iter().all(|reservation| &reservation.rows == first));
    assert_eq!(results.iter().filter(|reservation| !reservation.replayed).count(), 1);

    let state = machine.snapshot().await.unwrap().document;
    assert_eq!(state.allocated_units(), 3);
    let remaining: u32 = RowLayout::default()
        .ids()
        .iter()
        .map(|id| RowLayout::default().row_or_full(&state, *id).remaining)
        .sum();
    assert_eq!(remaining, 17);
}

#[tokio::test]
async fn injected_conflicts_are_retried_transparently() {
    let inner = InMemoryDocumentStore::<MachineState>::empty(DocumentPath::new("vending/machine1"));
    let conflicting = Arc::new(ConflictingDocumentStore::new(inner, 3));
    let machine = machine_over(Arc::clone(&conflicting) as Arc<dyn DocumentStore<MachineState>>);

    let reservation = machine.reserve(&OrderId::new("order_1"), 2).await.unwrap();

    assert_eq!(reservation.rows, vec![RowId::new(1), RowId::new(2)]);
    assert_eq!(conflicting.conflicts_injected(), 3);
    assert_eq!(conflicting.inner().version().await.value(), 1);
}

#[tokio::test]
async fn oversize_order_under_reject_leaves_the_machine_untouched() {
    let document = fresh_document();
    let machine = machine_over(Arc::clone(&document) as Arc<dyn DocumentStore<MachineState>>)
        .with_oversize_policy(OversizePolicy::Reject);

    let error = machine
        .reserve(&OrderId::new("order_big"), 999)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReserveError::Allocation(AllocationFailure::ExceedsCapacity {
            requested: 999,
            capacity: 20
        })
    ));
    assert_eq!(document.version().await.value(), 0);
    assert!(machine.snapshot().await.unwrap().document.orders.is_empty());
}

#[tokio::test]
async fn oversize_order_under_clamp_drains_the_machine() {
    let machine = machine_over(fresh_document());

    let reservation = machine.reserve(&OrderId::new("order_big"), 999).await.unwrap();

    assert_eq!(reservation.rows.len(), 20);
    let state = machine.snapshot().await.unwrap().document;
    assert_eq!(state.orders[&OrderId::new("order_big")].quantity, 20);
}

#[tokio::test]
async fn exhausted_order_commits_nothing() {
    let document = fresh_document();
    let machine = machine_over(Arc::clone(&document) as Arc<dyn DocumentStore<MachineState>>);
    machine.reserve(&OrderId::new("order_bulk"), 18).await.unwrap();
    let before = machine.snapshot().await.unwrap();

    let error = machine
        .reserve(&OrderId::new("order_short"), 3)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReserveError::Allocation(AllocationFailure::RowsExhausted {
            requested: 3,
            available: 2
        })
    ));
    let after = machine.snapshot().await.unwrap();
    assert_eq!(document.version().await.value(), 1);
    assert_eq!(after.version, before.version);
    assert_eq!(after.document.rows, before.document.rows);
    assert_eq!(after.document.orders, before.document.orders);
    assert_eq!(after.document.next_row, before.document.next_row);
    assert!(!after.document.orders.contains_key(&OrderId::new("order_short")));
}
