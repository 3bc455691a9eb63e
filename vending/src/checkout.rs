//! Checkout coordination.
//!
//! The checkout reducer turns payment-gateway callbacks into machine work:
//!
//! 1. `PaymentCreated`: record the order, sync `payment_created` to the machine
//!    and append an audit entry
//! 2. `PaymentSucceeded`: reserve rows (the only effect whose result matters)
//! 3. `ReservationCompleted` / `ReservationFailed`: sync the outcome and audit it
//! 4. `PaymentFailed`: sync and audit the failure
//!
//! Status syncs and audit appends are detached effects. They are retried a few
//! times, then logged and dropped; they never feed an action back and never
//! change the outcome of a checkout.

use crate::config::{Pricing, VendingConfig};
use crate::machine::{MachineStore, StatusUpdate};
use crate::types::{LogEntry, LogKind, MachineState, OrderId, RowId};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeMap;
use std::sync::Arc;
use vending_core::document::DocumentStore;
use vending_core::environment::Clock;
use vending_core::event_log::{EventLog, EventLogError};
use vending_core::{async_effect, detached_effect, effect::Effect, reducer::Reducer};
use vending_runtime::retry::{RetryPolicy, retry_with_predicate};
use vending_runtime::transaction::TransactionError;

/// Message shown when the gateway reports a failure without a description
pub const PAYMENT_FAILED_MESSAGE: &str = "Payment failed. Please try again.";

// ============================================================================
// State
// ============================================================================

/// Where a checkout currently is
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPhase {
    /// Payment order created, waiting for the gateway
    AwaitingPayment,
    /// Paid; rows are being reserved
    Reserving,
    /// Rows reserved; the dispenser takes over
    Reserved,
    /// Paid, but no rows could be reserved
    ReservationFailed,
    /// The gateway reported a failed payment
    PaymentFailed,
    /// The payment order was invalid and ignored
    Rejected,
}

/// One checkout as seen by the coordinator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    /// Packets ordered
    pub quantity: u32,
    /// Amount in minor units
    pub amount_minor: u64,
    /// Lifecycle phase
    pub phase: CheckoutPhase,
    /// Lanes reserved for the order
    pub rows: Vec<RowId>,
    /// Message to show the buyer when something went wrong
    pub error: Option<String>,
}

impl Checkout {
    const fn new(quantity: u32, amount_minor: u64, phase: CheckoutPhase) -> Self {
        Self {
            quantity,
            amount_minor,
            phase,
            rows: Vec::new(),
            error: None,
        }
    }
}

/// Checkouts handled by this process, keyed by order id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutState {
    /// Known checkouts
    pub checkouts: BTreeMap<OrderId, Checkout>,
}

impl CheckoutState {
    /// Look up a checkout
    #[must_use]
    pub fn get(&self, order_id: &OrderId) -> Option<&Checkout> {
        self.checkouts.get(order_id)
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Inputs of the checkout reducer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutAction {
    /// The gateway created a payment order
    PaymentCreated {
        /// Gateway order id
        order_id: OrderId,
        /// Packets ordered
        quantity: u32,
        /// Amount in minor units
        amount_minor: u64,
    },

    /// The gateway confirmed the payment
    PaymentSucceeded {
        /// Gateway order id
        order_id: OrderId,
        /// Packets ordered
        quantity: u32,
        /// Amount in minor units
        amount_minor: u64,
    },

    /// The gateway reported a failed payment
    PaymentFailed {
        /// Gateway order id
        order_id: OrderId,
        /// Packets ordered
        quantity: u32,
        /// Amount in minor units
        amount_minor: u64,
        /// Gateway's explanation
        description: Option<String>,
    },

    /// Rows were reserved (result of `PaymentSucceeded`)
    ReservationCompleted {
        /// Gateway order id
        order_id: OrderId,
        /// Lanes reserved
        rows: Vec<RowId>,
        /// The order had already been reserved earlier
        replayed: bool,
    },

    /// The reservation failed (result of `PaymentSucceeded`)
    ReservationFailed {
        /// Gateway order id
        order_id: OrderId,
        /// Message for the buyer
        message: String,
    },
}

impl CheckoutAction {
    /// Order the action is about
    #[must_use]
    pub const fn order_id(&self) -> &OrderId {
        match self {
            Self::PaymentCreated { order_id, .. }
            | Self::PaymentSucceeded { order_id, .. }
            | Self::PaymentFailed { order_id, .. }
            | Self::ReservationCompleted { order_id, .. }
            | Self::ReservationFailed { order_id, .. } => order_id,
        }
    }

    /// Whether the action ends the reservation started by `PaymentSucceeded`
    #[must_use]
    pub const fn is_reservation_outcome(&self) -> bool {
        matches!(
            self,
            Self::ReservationCompleted { .. } | Self::ReservationFailed { .. }
        )
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the checkout reducer
#[derive(Clone)]
pub struct CheckoutEnvironment {
    /// Machine document
    pub machine: MachineStore,
    /// Audit log
    pub log: Arc<dyn EventLog<LogEntry>>,
    /// Clock for audit timestamps
    pub clock: Arc<dyn Clock>,
    /// Price list
    pub pricing: Pricing,
    /// Retries for status syncs and audit appends
    pub side_channel_retry: RetryPolicy,
}

impl CheckoutEnvironment {
    /// Creates a new `CheckoutEnvironment`
    #[must_use]
    pub fn new(
        machine: MachineStore,
        log: Arc<dyn EventLog<LogEntry>>,
        clock: Arc<dyn Clock>,
        pricing: Pricing,
        side_channel_retry: RetryPolicy,
    ) -> Self {
        Self {
            machine,
            log,
            clock,
            pricing,
            side_channel_retry,
        }
    }

    /// Wire an environment from configuration and storage backends
    #[must_use]
    pub fn from_config(
        config: &VendingConfig,
        document: Arc<dyn DocumentStore<MachineState>>,
        log: Arc<dyn EventLog<LogEntry>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let machine = MachineStore::new(document, config.layout.clone(), Arc::clone(&clock))
            .with_oversize_policy(config.oversize_policy)
            .with_retry_policy(config.transaction_policy());

        Self::new(
            machine,
            log,
            clock,
            config.pricing.clone(),
            config.side_channel_policy(),
        )
    }
}

impl std::fmt::Debug for CheckoutEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutEnvironment")
            .field("machine", &self.machine)
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the checkout lifecycle
#[derive(Clone, Debug, Default)]
pub struct CheckoutReducer;

impl CheckoutReducer {
    /// Creates a new `CheckoutReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a new payment order
    fn validate_payment(quantity: u32, amount_minor: u64) -> Result<(), String> {
        if quantity == 0 {
            return Err("Quantity must be at least one packet".to_string());
        }
        if amount_minor == 0 {
            return Err("A valid amount is required".to_string());
        }
        Ok(())
    }

    /// Best-effort merge of `update` into the machine document
    ///
    /// Transient failures are retried; a document that no longer serializes is not.
    fn sync_status(update: StatusUpdate, env: &CheckoutEnvironment) -> Effect<CheckoutAction> {
        let machine = env.machine.clone();
        let policy = env.side_channel_retry.clone();

        detached_effect! {
            let synced = retry_with_predicate(
                &policy,
                || machine.apply_status(&update),
                TransactionError::is_transient,
            )
            .await;
            if let Err(error) = synced {
                metrics::counter!("vending.side_channel.failures", "channel" => "status").increment(1);
                tracing::warn!(error = %error, status = ?update.status, "Failed to sync machine status");
            }
        }
    }

    /// Best-effort audit append
    fn append_log(entry: LogEntry, env: &CheckoutEnvironment) -> Effect<CheckoutAction> {
        let log = Arc::clone(&env.log);
        let policy = env.side_channel_retry.clone();

        detached_effect! {
            let appended = retry_with_predicate(
                &policy,
                || log.append(entry.clone()),
                EventLogError::is_transient,
            )
            .await;
            if let Err(error) = appended {
                metrics::counter!("vending.side_channel.failures", "channel" => "log").increment(1);
                tracing::warn!(error = %error, kind = %entry.kind, "Failed to append audit entry");
            }
        }
    }

    /// Status sync and audit append, run side by side
    fn record(
        update: StatusUpdate,
        entry: LogEntry,
        env: &CheckoutEnvironment,
    ) -> SmallVec<[Effect<CheckoutAction>; 4]> {
        smallvec![Effect::merge(vec![
            Self::sync_status(update, env),
            Self::append_log(entry, env),
        ])]
    }
}

impl Reducer for CheckoutReducer {
    type State = CheckoutState;
    type Action = CheckoutAction;
    type Environment = CheckoutEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per lifecycle transition
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            CheckoutAction::PaymentCreated {
                order_id,
                quantity,
                amount_minor,
            } => {
                if let Err(error) = Self::validate_payment(quantity, amount_minor) {
                    tracing::warn!(%order_id, quantity, amount_minor, %error, "Rejected payment order");
                    let mut checkout = Checkout::new(quantity, amount_minor, CheckoutPhase::Rejected);
                    checkout.error = Some(error);
                    state.checkouts.insert(order_id, checkout);
                    return SmallVec::new();
                }

                let quote = env.pricing.quote(quantity);
                if quote != amount_minor {
                    tracing::warn!(%order_id, quote, amount_minor, "Payment amount differs from price list");
                }

                tracing::info!(%order_id, quantity, amount_minor, "Payment created");
                state.checkouts.insert(
                    order_id.clone(),
                    Checkout::new(quantity, amount_minor, CheckoutPhase::AwaitingPayment),
                );

                let entry = LogEntry::new(
                    LogKind::PaymentCreated,
                    order_id.clone(),
                    amount_minor,
                    quantity,
                    env.clock.now(),
                );
                Self::record(
                    StatusUpdate::payment_created(order_id, amount_minor, quantity),
                    entry,
                    env,
                )
            },

            CheckoutAction::PaymentSucceeded {
                order_id,
                quantity,
                amount_minor,
            } => {
                let checkout = state
                    .checkouts
                    .entry(order_id.clone())
                    .or_insert_with(|| Checkout::new(quantity, amount_minor, CheckoutPhase::AwaitingPayment));

                if checkout.phase == CheckoutPhase::Reserving {
                    tracing::debug!(%order_id, "Reservation already in flight, ignoring duplicate confirmation");
                    return SmallVec::new();
                }

                tracing::info!(%order_id, quantity, "Payment confirmed, reserving rows");
                checkout.phase = CheckoutPhase::Reserving;
                checkout.error = None;

                let machine = env.machine.clone();
                smallvec![async_effect! {
                    match machine.reserve(&order_id, quantity).await {
                        Ok(reservation) => Some(CheckoutAction::ReservationCompleted {
                            order_id,
                            rows: reservation.rows,
                            replayed: reservation.replayed,
                        }),
                        Err(error) => Some(CheckoutAction::ReservationFailed {
                            order_id,
                            message: error.user_message(),
                        }),
                    }
                }]
            },

            CheckoutAction::ReservationCompleted {
                order_id,
                rows,
                replayed,
            } => {
                let Some(checkout) = state.checkouts.get_mut(&order_id) else {
                    tracing::warn!(%order_id, "Reservation completed for unknown checkout");
                    return SmallVec::new();
                };

                checkout.phase = CheckoutPhase::Reserved;
                checkout.rows.clone_from(&rows);

                if replayed {
                    tracing::debug!(%order_id, "Reservation replayed, machine already instructed");
                    return SmallVec::new();
                }

                let (quantity, amount_minor) = (checkout.quantity, checkout.amount_minor);
                let entry = LogEntry::new(
                    LogKind::PaymentSuccess,
                    order_id,
                    amount_minor,
                    quantity,
                    env.clock.now(),
                )
                .with_rows(rows.clone());

                Self::record(StatusUpdate::payment_success(rows, quantity), entry, env)
            },

            CheckoutAction::ReservationFailed { order_id, message } => {
                let Some(checkout) = state.checkouts.get_mut(&order_id) else {
                    tracing::warn!(%order_id, "Reservation failed for unknown checkout");
                    return SmallVec::new();
                };

                checkout.phase = CheckoutPhase::ReservationFailed;
                checkout.error = Some(message.clone());

                let entry = LogEntry::new(
                    LogKind::OrderReservationFailed,
                    order_id,
                    checkout.amount_minor,
                    checkout.quantity,
                    env.clock.now(),
                )
                .with_reason(message.clone());

                Self::record(StatusUpdate::out_of_stock(message), entry, env)
            },

            CheckoutAction::PaymentFailed {
                order_id,
                quantity,
                amount_minor,
                description,
            } => {
                tracing::warn!(%order_id, description = ?description, "Payment failed");

                let checkout = state
                    .checkouts
                    .entry(order_id.clone())
                    .or_insert_with(|| Checkout::new(quantity, amount_minor, CheckoutPhase::AwaitingPayment));
                checkout.phase = CheckoutPhase::PaymentFailed;
                checkout.error = Some(
                    description
                        .clone()
                        .unwrap_or_else(|| PAYMENT_FAILED_MESSAGE.to_string()),
                );

                let entry = LogEntry::new(
                    LogKind::PaymentFailed,
                    order_id,
                    amount_minor,
                    quantity,
                    env.clock.now(),
                )
                .with_reason(description.unwrap_or_else(|| "unknown".to_string()));

                Self::record(StatusUpdate::payment_failed(), entry, env)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use vending_core::document::DocumentPath;
    use vending_runtime::memory::{InMemoryDocumentStore, InMemoryEventLog};
    use vending_testing::{ReducerTest, assertions, test_clock};

    fn env() -> CheckoutEnvironment {
        let config = VendingConfig::default();
        CheckoutEnvironment::from_config(
            &config,
            Arc::new(InMemoryDocumentStore::new(
                config.machine_path.clone(),
                MachineState::default(),
            )),
            Arc::new(InMemoryEventLog::<LogEntry>::new(DocumentPath::new("vending/machine1/logs"))),
            Arc::new(test_clock()),
        )
    }

    fn order() -> OrderId {
        OrderId::new("order_1")
    }

    #[test]
    fn payment_created_records_checkout_and_side_channels() {
        ReducerTest::new(CheckoutReducer::new())
            .with_env(env())
            .given_state(CheckoutState::default())
            .when_action(CheckoutAction::PaymentCreated {
                order_id: order(),
                quantity: 2,
                amount_minor: 2000,
            })
            .then_state(|state| {
                let checkout = state.get(&order()).unwrap();
                assert_eq!(checkout.phase, CheckoutPhase::AwaitingPayment);
                assert_eq!(checkout.amount_minor, 2000);
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 2);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[test]
    fn invalid_payment_order_is_rejected_without_effects() {
        ReducerTest::new(CheckoutReducer::new())
            .with_env(env())
            .given_state(CheckoutState::default())
            .when_action(CheckoutAction::PaymentCreated {
                order_id: order(),
                quantity: 0,
                amount_minor: 1000,
            })
            .then_state(|state| {
                let checkout = state.get(&order()).unwrap();
                assert_eq!(checkout.phase, CheckoutPhase::Rejected);
                assert!(checkout.error.is_some());
            })
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn duplicate_confirmation_while_reserving_is_ignored() {
        let succeeded = CheckoutAction::PaymentSucceeded {
            order_id: order(),
            quantity: 1,
            amount_minor: 1000,
        };

        ReducerTest::new(CheckoutReducer::new())
            .with_env(env())
            .given_state(CheckoutState::default())
            .when_action(succeeded.clone())
            .when_action(succeeded)
            .then_state(|state| {
                assert_eq!(state.get(&order()).unwrap().phase, CheckoutPhase::Reserving);
            })
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn replayed_reservation_skips_side_channels() {
        ReducerTest::new(CheckoutReducer::new())
            .with_env(env())
            .given_state(CheckoutState::default())
            .when_action(CheckoutAction::PaymentSucceeded {
                order_id: order(),
                quantity: 1,
                amount_minor: 1000,
            })
            .when_action(CheckoutAction::ReservationCompleted {
                order_id: order(),
                rows: vec![RowId::new(1)],
                replayed: true,
            })
            .then_state(|state| {
                let checkout = state.get(&order()).unwrap();
                assert_eq!(checkout.phase, CheckoutPhase::Reserved);
                assert_eq!(checkout.rows, vec![RowId::new(1)]);
            })
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn payment_failure_without_description_uses_fallback_message() {
        ReducerTest::new(CheckoutReducer::new())
            .with_env(env())
            .given_state(CheckoutState::default())
            .when_action(CheckoutAction::PaymentFailed {
                order_id: order(),
                quantity: 1,
                amount_minor: 1000,
                description: None,
            })
            .then_state(|state| {
                let checkout = state.get(&order()).unwrap();
                assert_eq!(checkout.phase, CheckoutPhase::PaymentFailed);
                assert_eq!(checkout.error.as_deref(), Some(PAYMENT_FAILED_MESSAGE));
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 2))
            .run();
    }
}
