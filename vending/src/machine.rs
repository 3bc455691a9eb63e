//! The shared machine store.
//!
//! [`MachineStore`] is the only writer of the machine document. Every mutation
//! is an optimistic transaction: load the current version, run a pure
//! transform, compare-and-swap. Concurrent checkouts never overwrite each
//! other; the loser of a race re-runs its transform on the winner's document.

use crate::allocation::{Allocation, AllocationFailure, OversizePolicy, RowLayout, allocate};
use crate::status::{StatusInput, StatusView, derive_status};
use crate::types::{MachineState, MachineStatus, OrderId, RowId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use vending_core::document::{DocumentPath, DocumentStore, DocumentStoreError, Versioned};
use vending_core::environment::Clock;
use vending_runtime::retry::RetryPolicy;
use vending_runtime::transaction::{Outcome, TransactionError, transact};

/// Message shown when a reservation fails for a reason other than stock.
pub const RESERVATION_FALLBACK_MESSAGE: &str = "Unable to reserve stock. Please contact support.";

/// Errors from [`MachineStore::reserve`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    /// The order cannot be served from the current stock
    #[error(transparent)]
    Allocation(#[from] AllocationFailure),

    /// The machine document could not be updated
    #[error("Reservation could not be committed: {0}")]
    Transaction(#[from] TransactionError),
}

impl ReserveError {
    /// Message suitable for the buyer
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Allocation(failure) => failure.to_string(),
            Self::Transaction(_) => RESERVATION_FALLBACK_MESSAGE.to_string(),
        }
    }
}

/// Errors from the maintenance operations of [`MachineStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// The row is not part of the configured layout
    #[error("Row {0} is not configured on this machine")]
    UnknownRow(RowId),

    /// No order with this id is recorded
    #[error("Order {0} is not recorded on this machine")]
    UnknownOrder(OrderId),

    /// The machine document could not be updated
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Rows reserved for an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// One lane per unit
    pub rows: Vec<RowId>,
    /// True when the order was already recorded and nothing was consumed
    pub replayed: bool,
}

/// Partial update of the scalar status fields
///
/// Fields left as `None` are not touched. `updated_at` is always stamped.
/// An update created for a specific order can be superseded: once that order
/// is reserved or has moved past creation, the update is skipped entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    /// New status
    pub status: Option<MachineStatus>,
    /// New dispense instruction
    pub dispense: Option<bool>,
    /// Order the fields now describe
    pub payment_id: Option<OrderId>,
    /// Lanes for the actuator; an empty list clears them
    pub assigned_rows: Option<Vec<RowId>>,
    /// `Some(None)` clears the last error
    pub last_error: Option<Option<String>>,
    /// Amount of a newly created payment
    pub last_amount: Option<u64>,
    /// Quantity of a newly created payment
    pub last_quantity: Option<u32>,
    /// Quantity of a confirmed order
    pub last_order_quantity: Option<u32>,
    /// Skip the update once this order has settled
    pub unless_settled: Option<OrderId>,
}

impl StatusUpdate {
    /// A payment order was created and the dispenser should stand by
    #[must_use]
    pub fn payment_created(order_id: OrderId, amount_minor: u64, quantity: u32) -> Self {
        Self {
            status: Some(MachineStatus::PaymentCreated),
            dispense: Some(false),
            payment_id: Some(order_id.clone()),
            last_amount: Some(amount_minor),
            last_quantity: Some(quantity),
            unless_settled: Some(order_id),
            ..Self::default()
        }
    }

    /// Rows are reserved; tell the dispenser to drop them
    #[must_use]
    pub fn payment_success(rows: Vec<RowId>, quantity: u32) -> Self {
        Self {
            status: Some(MachineStatus::PaymentSuccess),
            dispense: Some(true),
            assigned_rows: Some(rows),
            last_order_quantity: Some(quantity),
            last_error: Some(None),
            ..Self::default()
        }
    }

    /// The paid order could not be reserved
    #[must_use]
    pub fn out_of_stock(message: impl Into<String>) -> Self {
        Self {
            status: Some(MachineStatus::OutOfStock),
            dispense: Some(false),
            assigned_rows: Some(Vec::new()),
            last_error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    /// The gateway reported a failed payment
    #[must_use]
    pub fn payment_failed() -> Self {
        Self {
            status: Some(MachineStatus::PaymentFailed),
            dispense: Some(false),
            ..Self::default()
        }
    }

    /// Whether `state` already records a later step of the guarded order
    #[must_use]
    pub fn is_superseded_in(&self, state: &MachineState) -> bool {
        let Some(order_id) = &self.unless_settled else {
            return false;
        };
        state.orders.contains_key(order_id)
            || (state.payment_id.as_ref() == Some(order_id)
                && !matches!(state.status, MachineStatus::Pending | MachineStatus::PaymentCreated))
    }

    /// Apply the update to a document
    pub fn apply_to(&self, state: &mut MachineState, now: DateTime<Utc>) {
        if let Some(status) = &self.status {
            state.status = status.clone();
        }
        if let Some(dispense) = self.dispense {
            state.dispense = dispense;
        }
        if let Some(payment_id) = &self.payment_id {
            state.payment_id = Some(payment_id.clone());
        }
        if let Some(rows) = &self.assigned_rows {
            state.assigned_rows.clone_from(rows);
        }
        if let Some(last_error) = &self.last_error {
            state.last_error.clone_from(last_error);
        }
        if let Some(amount) = self.last_amount {
            state.last_amount = Some(amount);
        }
        if let Some(quantity) = self.last_quantity {
            state.last_quantity = Some(quantity);
        }
        if let Some(quantity) = self.last_order_quantity {
            state.last_order_quantity = Some(quantity);
        }
        state.updated_at = Some(now);
    }
}

/// Transactional access to one machine document
#[derive(Clone)]
pub struct MachineStore {
    document: Arc<dyn DocumentStore<MachineState>>,
    clock: Arc<dyn Clock>,
    layout: RowLayout,
    oversize_policy: OversizePolicy,
    retry: RetryPolicy,
}

impl MachineStore {
    /// Create a store over `document` with the default oversize and retry policies
    #[must_use]
    pub fn new(
        document: Arc<dyn DocumentStore<MachineState>>,
        layout: RowLayout,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            document,
            clock,
            layout,
            oversize_policy: OversizePolicy::default(),
            retry: RetryPolicy::builder().max_retries(32).build(),
        }
    }

    /// Use `policy` for orders larger than the machine
    #[must_use]
    pub const fn with_oversize_policy(mut self, policy: OversizePolicy) -> Self {
        self.oversize_policy = policy;
        self
    }

    /// Use `policy` to bound retries after conflicting writes
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Address of the machine document
    #[must_use]
    pub fn path(&self) -> &DocumentPath {
        self.document.path()
    }

    /// Lane configuration
    #[must_use]
    pub const fn layout(&self) -> &RowLayout {
        &self.layout
    }

    /// Reserve rows for a paid order.
    ///
    /// Re-entrant: an order id that is already recorded returns its rows
    /// without consuming stock.
    ///
    /// # Errors
    ///
    /// - [`ReserveError::Allocation`]: not enough stock, or an oversize order under `Reject`
    /// - [`ReserveError::Transaction`]: persistent contention or an unreachable store
    #[tracing::instrument(skip(self), fields(path = %self.path()))]
    pub async fn reserve(&self, order_id: &OrderId, quantity: u32) -> Result<Reservation, ReserveError> {
        let now = self.clock.now();

        let result = transact(self.document.as_ref(), &self.retry, |state: &MachineState| {
            match allocate(state, order_id, quantity, &self.layout, self.oversize_policy, now) {
                Ok(Allocation::Reserved { state, rows }) => Outcome::Commit {
                    document: state,
                    value: Ok(Reservation {
                        rows,
                        replayed: false,
                    }),
                },
                Ok(Allocation::Existing { rows }) => Outcome::Abort(Ok(Reservation {
                    rows,
                    replayed: true,
                })),
                Err(failure) => Outcome::Abort(Err(failure)),
            }
        })
        .await;

        match result {
            Ok(Ok(reservation)) if reservation.replayed => {
                metrics::counter!("vending.allocation.replayed").increment(1);
                tracing::info!(rows = ?reservation.rows, "Order already reserved, returning recorded rows");
                Ok(reservation)
            },
            Ok(Ok(reservation)) => {
                metrics::counter!("vending.allocation.reserved").increment(1);
                metrics::counter!("vending.allocation.units").increment(reservation.rows.len() as u64);
                tracing::info!(rows = ?reservation.rows, "Rows reserved");
                Ok(reservation)
            },
            Ok(Err(failure)) => {
                metrics::counter!("vending.allocation.rejected", "reason" => failure.reason()).increment(1);
                tracing::error!(error = %failure, "Reservation failed");
                Err(failure.into())
            },
            Err(error) => {
                metrics::counter!("vending.allocation.rejected", "reason" => "transaction").increment(1);
                tracing::error!(error = %error, "Reservation could not be committed");
                Err(error.into())
            },
        }
    }

    /// Merge a status update into the document.
    ///
    /// Returns `false` when the update was superseded and nothing was written.
    /// The check runs against the document each attempt reads, so a conflict
    /// with a newer write re-evaluates it.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError`] if the write cannot be committed.
    #[tracing::instrument(skip(self, update), fields(path = %self.path(), status = ?update.status))]
    pub async fn apply_status(&self, update: &StatusUpdate) -> Result<bool, TransactionError> {
        let now = self.clock.now();
        let applied = transact(self.document.as_ref(), &self.retry, |state: &MachineState| {
            if update.is_superseded_in(state) {
                return Outcome::Abort(false);
            }
            let mut next = state.clone();
            update.apply_to(&mut next, now);
            Outcome::Commit {
                document: next,
                value: true,
            }
        })
        .await?;

        if applied {
            tracing::debug!("Status synced");
        } else {
            metrics::counter!("vending.status.superseded").increment(1);
            tracing::debug!(status = ?update.status, "Status update superseded by a later step");
        }
        Ok(applied)
    }

    /// Put units back into a lane, up to its capacity.
    ///
    /// Returns the lane's new `remaining`. Counters of past orders are untouched.
    ///
    /// # Errors
    ///
    /// - [`MachineError::UnknownRow`]: `row` is not configured
    /// - [`MachineError::Transaction`]: the write cannot be committed
    #[tracing::instrument(skip(self), fields(path = %self.path()))]
    pub async fn restock(&self, row: RowId, units: u32) -> Result<u32, MachineError> {
        if !self.layout.contains(row) {
            return Err(MachineError::UnknownRow(row));
        }

        let now = self.clock.now();
        let remaining = transact(self.document.as_ref(), &self.retry, |state: &MachineState| {
            let mut lane = self.layout.row_or_full(state, row);
            lane.remaining = lane.remaining.saturating_add(units).min(lane.capacity);
            lane.last_updated = Some(now);
            let remaining = lane.remaining;

            let mut next = state.clone();
            next.rows.insert(row, lane);
            Outcome::Commit {
                document: next,
                value: remaining,
            }
        })
        .await?;

        tracing::info!(remaining, "Row restocked");
        Ok(remaining)
    }

    /// Record the actuator's acknowledgement that an order was dropped.
    ///
    /// Acknowledging twice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`MachineError::UnknownOrder`]: the order was never reserved
    /// - [`MachineError::Transaction`]: the write cannot be committed
    #[tracing::instrument(skip(self), fields(path = %self.path()))]
    pub async fn acknowledge_dispense(&self, order_id: &OrderId) -> Result<(), MachineError> {
        let now = self.clock.now();
        transact(self.document.as_ref(), &self.retry, |state: &MachineState| {
            let Some(order) = state.orders.get(order_id) else {
                return Outcome::Abort(Err(MachineError::UnknownOrder(order_id.clone())));
            };
            if order.dispensed {
                return Outcome::Abort(Ok(()));
            }

            let mut next = state.clone();
            if let Some(order) = next.orders.get_mut(order_id) {
                order.dispensed = true;
            }
            next.dispense = false;
            next.status = MachineStatus::Dispensed;
            next.last_dispensed = Some(now);
            next.updated_at = Some(now);
            Outcome::Commit {
                document: next,
                value: Ok(()),
            }
        })
        .await?
    }

    /// Current document and version.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError`] if the store cannot be read.
    pub async fn snapshot(&self) -> Result<Versioned<MachineState>, DocumentStoreError> {
        self.document.load().await
    }

    /// User-facing status of the machine.
    ///
    /// An unreadable document is reported as an offline machine, never as an error.
    pub async fn status(&self) -> StatusView {
        match self.document.load().await {
            Ok(snapshot) => derive_status(&StatusInput::from(&snapshot.document)),
            Err(error) => {
                tracing::warn!(error = %error, "Machine document unavailable");
                derive_status(&StatusInput::unavailable())
            },
        }
    }
}

impl std::fmt::Debug for MachineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineStore")
            .field("path", self.path())
            .field("layout", &self.layout)
            .field("oversize_policy", &self.oversize_policy)
            .finish_non_exhaustive()
    }
}
