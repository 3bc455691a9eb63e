//! Domain types for the vending machine.
//!
//! The machine is a single document: per-row counters, the round-robin pointer,
//! the order ledger and the scalar fields describing the most recent transaction.
//! Field names on the wire follow the document the dispenser firmware reads
//! (`nextRow`, `dispensedCount`, `assigned_rows`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of one physical dispensing lane
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(u32);

impl RowId {
    /// Create a `RowId`
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the numeric lane number
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RowId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<u32> for RowId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifier of a payment order, issued by the payment gateway
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Create an `OrderId`
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OrderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Rows and orders
// ============================================================================

/// Counters for one lane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Maximum units the lane holds
    pub capacity: u32,
    /// Units still in the lane
    pub remaining: u32,
    /// Units ever reserved from this lane; never decreases
    pub dispensed_count: u32,
    /// Last time an allocation or restock touched the lane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Row {
    /// A fully stocked lane that has never dispensed
    #[must_use]
    pub const fn full(capacity: u32) -> Self {
        Self {
            capacity,
            remaining: capacity,
            dispensed_count: 0,
            last_updated: None,
        }
    }
}

/// Ledger entry for one paid order
///
/// Created once by the allocation; only `dispensed` changes afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    /// First assigned lane, kept for readers that predate `rows`
    pub row: RowId,
    /// One lane per reserved unit, in allocation order
    #[serde(default)]
    pub rows: Vec<RowId>,
    /// Units reserved (the requested quantity after normalisation)
    pub quantity: u32,
    /// Always true: allocation only runs after payment confirmation
    pub paid: bool,
    /// Set once the actuator acknowledges the drop
    pub dispensed: bool,
    /// When the reservation was committed
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    /// The lanes reserved for this order.
    ///
    /// Records written by older readers may carry only `row`.
    #[must_use]
    pub fn reserved_rows(&self) -> Vec<RowId> {
        if self.rows.is_empty() {
            vec![self.row]
        } else {
            self.rows.clone()
        }
    }
}

// ============================================================================
// Machine status
// ============================================================================

/// Lifecycle status written to the machine document
///
/// Serialized as its snake_case name. Statuses written by the dispenser that
/// this crate does not know are preserved verbatim in [`MachineStatus::Other`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MachineStatus {
    /// Nothing has happened yet
    #[default]
    Pending,
    /// A payment order exists but is not confirmed
    PaymentCreated,
    /// Payment confirmed and rows reserved
    PaymentSuccess,
    /// The gateway reported a failed payment
    PaymentFailed,
    /// Payment succeeded but no rows could be reserved
    OutOfStock,
    /// The dispenser is dropping units
    Dispensing,
    /// The dispenser acknowledged the drop
    Dispensed,
    /// Terminal success as reported by some firmware versions
    Completed,
    /// Terminal success as reported by some firmware versions
    Done,
    /// The machine reported a fault
    Error,
    /// No machine data could be read
    Unavailable,
    /// Any other status string
    Other(String),
}

impl MachineStatus {
    /// The wire name of the status
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::PaymentCreated => "payment_created",
            Self::PaymentSuccess => "payment_success",
            Self::PaymentFailed => "payment_failed",
            Self::OutOfStock => "out_of_stock",
            Self::Dispensing => "dispensing",
            Self::Dispensed => "dispensed",
            Self::Completed => "completed",
            Self::Done => "done",
            Self::Error => "error",
            Self::Unavailable => "unavailable",
            Self::Other(other) => other,
        }
    }

    /// Whether the status ends the lifecycle successfully
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Dispensed | Self::Completed | Self::Done)
    }

    /// Whether the status is a user-visible failure
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::PaymentFailed | Self::OutOfStock | Self::Error)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MachineStatus {
    fn from(status: &str) -> Self {
        match status {
            "pending" => Self::Pending,
            "payment_created" => Self::PaymentCreated,
            "payment_success" => Self::PaymentSuccess,
            "payment_failed" => Self::PaymentFailed,
            "out_of_stock" => Self::OutOfStock,
            "dispensing" => Self::Dispensing,
            "dispensed" => Self::Dispensed,
            "completed" => Self::Completed,
            "done" => Self::Done,
            "error" => Self::Error,
            "unavailable" => Self::Unavailable,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for MachineStatus {
    fn from(status: String) -> Self {
        match Self::from(status.as_str()) {
            Self::Other(_) => Self::Other(status),
            known => known,
        }
    }
}

impl From<MachineStatus> for String {
    fn from(status: MachineStatus) -> Self {
        match status {
            MachineStatus::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

// ============================================================================
// Machine document
// ============================================================================

/// The singleton machine document
///
/// `rows` may omit lanes that have never been touched; readers treat a missing
/// lane as fully stocked.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineState {
    /// Per-lane counters
    pub rows: BTreeMap<RowId, Row>,
    /// Lane where the next allocation scan starts
    #[serde(rename = "nextRow", skip_serializing_if = "Option::is_none")]
    pub next_row: Option<RowId>,
    /// Order ledger, keyed by order id
    pub orders: BTreeMap<OrderId, OrderRecord>,

    /// Status of the most recent transaction
    pub status: MachineStatus,
    /// Instruction to the actuator: drop the units in `assigned_rows`
    pub dispense: bool,
    /// Lanes the actuator should drop from
    pub assigned_rows: Vec<RowId>,
    /// Human-readable reason for the last failure
    pub last_error: Option<String>,
    /// Last time any scalar field was written
    pub updated_at: Option<DateTime<Utc>>,
    /// Order the scalar fields describe
    pub payment_id: Option<OrderId>,
    /// Amount of the last created payment, in minor units
    pub last_amount: Option<u64>,
    /// Quantity of the last created payment
    pub last_quantity: Option<u32>,
    /// Quantity of the last confirmed order
    pub last_order_quantity: Option<u32>,
    /// Last actuator acknowledgement
    pub last_dispensed: Option<DateTime<Utc>>,
    /// Progress reported by a richer backend, 0-100
    pub progress: Option<i32>,
}

impl MachineState {
    /// Units reserved by recorded orders
    #[must_use]
    pub fn allocated_units(&self) -> u64 {
        self.orders.values().map(|order| u64::from(order.quantity)).sum()
    }
}

// ============================================================================
// Audit log
// ============================================================================

/// Kind of an audit entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// A payment order was created
    PaymentCreated,
    /// Payment confirmed and rows reserved
    PaymentSuccess,
    /// The gateway reported a failed payment
    PaymentFailed,
    /// Payment confirmed but the reservation failed
    OrderReservationFailed,
}

impl LogKind {
    /// The wire name of the kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PaymentCreated => "payment_created",
            Self::PaymentSuccess => "payment_success",
            Self::PaymentFailed => "payment_failed",
            Self::OrderReservationFailed => "order_reservation_failed",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// What happened
    #[serde(rename = "type")]
    pub kind: LogKind,
    /// Order the entry is about
    pub payment_id: OrderId,
    /// Order amount in minor units
    pub amount: u64,
    /// Requested quantity
    pub quantity: u32,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Reserved lanes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<RowId>>,
}

impl LogEntry {
    /// Entry without reason or rows
    #[must_use]
    pub const fn new(
        kind: LogKind,
        payment_id: OrderId,
        amount: u64,
        quantity: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            payment_id,
            amount,
            quantity,
            timestamp,
            reason: None,
            rows: None,
        }
    }

    /// Attach a failure reason
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the reserved lanes
    #[must_use]
    pub fn with_rows(mut self, rows: Vec<RowId>) -> Self {
        self.rows = Some(rows);
        self
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} x{} ({} minor units)",
            self.kind, self.payment_id, self.quantity, self.amount
        )?;
        if let Some(rows) = &self.rows {
            let rows: Vec<String> = rows.iter().map(ToString::to_string).collect();
            write!(f, " rows [{}]", rows.join(", "))?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}
