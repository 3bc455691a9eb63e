//! Integration tests for Store action broadcasting
//!
//! Payment callbacks wait for the outcome of the work they start through
//! `send_and_wait_for`; dashboards follow everything with `subscribe_actions`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use vending_core::{SmallVec, effect::Effect, reducer::Reducer, smallvec};
use vending_runtime::{Store, StoreError};

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum DispenseAction {
    /// Start dropping `units` packets for an order
    Dispense { order: u64, units: u32 },
    /// One packet dropped
    UnitDropped { order: u64, unit: u32 },
    /// All packets dropped (terminal)
    Dispensed { order: u64 },
    /// Never produced; used to provoke timeouts
    Jammed { order: u64 },
    /// Restock one lane
    Restock,
    /// Restock recorded
    Restocked { lanes: u32 },
    /// Log-only action with a detached effect
    Audit,
}

#[derive(Debug, Clone, Default)]
struct DispenseState {
    lanes_restocked: u32,
    drops: Vec<(u64, u32)>,
}

#[derive(Clone)]
struct DispenseEnvironment {
    drop_time: Duration,
}

#[derive(Clone)]
struct DispenseReducer;

impl Reducer for DispenseReducer {
    type State = DispenseState;
    type Action = DispenseAction;
    type Environment = DispenseEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let drop_time = env.drop_time;
        match action {
            DispenseAction::Dispense { order, units } => smallvec![Effect::Future(Box::pin(async move {
                tokio::time::sleep(drop_time).await;
                Some(if units == 0 {
                    DispenseAction::Dispensed { order }
                } else {
                    DispenseAction::UnitDropped { order, unit: 1 }
                })
            }))],

            DispenseAction::UnitDropped { order, unit } => {
                state.drops.push((order, unit));
                smallvec![Effect::Future(Box::pin(async move {
                    tokio::time::sleep(drop_time).await;
                    Some(if unit >= 3 {
                        DispenseAction::Dispensed { order }
                    } else {
                        DispenseAction::UnitDropped { order, unit: unit + 1 }
                    })
                }))]
            },

            DispenseAction::Restock => {
                state.lanes_restocked += 1;
                let lanes = state.lanes_restocked;
                smallvec![Effect::Future(Box::pin(async move {
                    Some(DispenseAction::Restocked { lanes })
                }))]
            },

            DispenseAction::Audit => smallvec![Effect::Future(Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                None
            }))],

            DispenseAction::Dispensed { .. }
            | DispenseAction::Jammed { .. }
            | DispenseAction::Restocked { .. } => smallvec![Effect::None],
        }
    }
}

type DispenseStore = Store<DispenseState, DispenseAction, DispenseEnvironment, DispenseReducer>;

fn store() -> DispenseStore {
    Store::new(
        DispenseState::default(),
        DispenseReducer,
        DispenseEnvironment {
            drop_time: Duration::from_millis(5),
        },
    )
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<DispenseAction>) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn wait_for_immediate_result() {
    let store = store();

    let result = store
        .send_and_wait_for(
            DispenseAction::Restock,
            |action| matches!(action, DispenseAction::Restocked { .. }),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(result, DispenseAction::Restocked { lanes: 1 });
}

#[tokio::test]
async fn wait_for_multi_step_result() {
    let store = store();

    let result = store
        .send_and_wait_for(
            DispenseAction::Dispense { order: 7, units: 3 },
            |action| matches!(action, DispenseAction::Dispensed { order: 7 }),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(result, DispenseAction::Dispensed { order: 7 });
    let drops = store.state(|s| s.drops.clone()).await;
    assert_eq!(drops, vec![(7, 1), (7, 2), (7, 3)]);
}

#[tokio::test]
async fn wait_for_times_out_when_result_never_comes() {
    let store = store();

    let result = store
        .send_and_wait_for(
            DispenseAction::Dispense { order: 9, units: 3 },
            |action| matches!(action, DispenseAction::Jammed { order: 9 }),
            Duration::from_millis(50),
        )
        .await;

    assert!(matches!(result, Err(StoreError::Timeout)));
}

#[tokio::test]
async fn concurrent_waiters_only_see_their_own_order() {
    let store = Arc::new(store());

    let mut handles = Vec::new();
    for order in 1..=5 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .send_and_wait_for(
                    DispenseAction::Dispense { order, units: 3 },
                    move |action| matches!(action, DispenseAction::Dispensed { order: done } if *done == order),
                    Duration::from_secs(2),
                )
                .await
        }));
    }

    for (index, handle) in handles.into_iter().enumerate() {
        let order = u64::try_from(index).unwrap() + 1;
        let result = handle.await.expect("Task panicked").unwrap();
        assert_eq!(result, DispenseAction::Dispensed { order });
    }

    let drops = store.state(|s| s.drops.len()).await;
    assert_eq!(drops, 15);
}

#[tokio::test]
async fn subscribers_receive_every_fed_back_action_in_order() {
    let store = store();
    let mut rx = store.subscribe_actions();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let collector = tokio::spawn(async move {
        while sink.lock().await.len() < 4 {
            if let Ok(action) = rx.recv().await {
                sink.lock().await.push(action);
            }
        }
    });

    store.send(DispenseAction::Dispense { order: 100, units: 3 }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), collector)
        .await
        .unwrap()
        .unwrap();

    let actions = received.lock().await;
    assert_eq!(
        *actions,
        vec![
            DispenseAction::UnitDropped { order: 100, unit: 1 },
            DispenseAction::UnitDropped { order: 100, unit: 2 },
            DispenseAction::UnitDropped { order: 100, unit: 3 },
            DispenseAction::Dispensed { order: 100 },
        ]
    );
}

#[tokio::test]
async fn lagging_subscriber_skips_old_actions() {
    let store = Store::with_broadcast_capacity(
        DispenseState::default(),
        DispenseReducer,
        DispenseEnvironment {
            drop_time: Duration::ZERO,
        },
        4,
    );
    let mut rx = store.subscribe_actions();

    for _ in 0..20 {
        store.send(DispenseAction::Restock).await.unwrap();
    }
    store.settle(Duration::from_secs(1)).await.unwrap();

    let mut received = 0;
    let mut lagged = false;
    loop {
        match rx.try_recv() {
            Ok(_) => received += 1,
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => lagged = true,
            Err(_) => break,
        }
    }

    assert!(lagged, "Expected subscriber to lag");
    assert!(received > 0 && received < 20);
}

#[tokio::test]
async fn independent_subscribers_each_see_all_actions() {
    let store = store();
    let mut first = store.subscribe_actions();
    let mut second = store.subscribe_actions();

    store.send(DispenseAction::Restock).await.unwrap();
    store.send(DispenseAction::Restock).await.unwrap();
    store.settle(Duration::from_secs(1)).await.unwrap();

    assert_eq!(drain(&mut first), 2);
    assert_eq!(drain(&mut second), 2);
}

#[tokio::test]
async fn detached_effects_are_awaited_by_settle_but_never_broadcast() {
    let store = store();
    let mut rx = store.subscribe_actions();

    store.send(DispenseAction::Audit).await.unwrap();
    assert_eq!(store.pending_effects(), 1);

    store.settle(Duration::from_secs(1)).await.unwrap();

    assert_eq!(store.pending_effects(), 0);
    assert_eq!(drain(&mut rx), 0);
}

#[tokio::test]
async fn shutdown_lets_an_in_flight_chain_finish_but_rejects_new_work() {
    let store = store();
    let mut rx = store.subscribe_actions();

    store.send(DispenseAction::Dispense { order: 11, units: 3 }).await.unwrap();
    store.shutdown(Duration::from_secs(1)).await.unwrap();

    let drops = store.state(|s| s.drops.clone()).await;
    assert_eq!(drops, vec![(11, 1), (11, 2), (11, 3)]);

    let mut last = None;
    while let Ok(action) = rx.try_recv() {
        last = Some(action);
    }
    assert_eq!(last, Some(DispenseAction::Dispensed { order: 11 }));

    assert!(matches!(
        store.send(DispenseAction::Restock).await,
        Err(StoreError::ShutdownInProgress)
    ));
}
