//! Row allocation.
//!
//! [`allocate`] is a pure transform from the current machine document to the
//! document with one order's units reserved. It never mutates its input, so the
//! optimistic transaction that drives it can re-run it against a fresh snapshot
//! after a conflicting write.
//!
//! Units are taken one at a time, round-robin from the stored pointer, skipping
//! empty lanes. Either every unit of the order is reserved or nothing changes.

use crate::types::{MachineState, OrderId, OrderRecord, Row, RowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Static lane configuration of a machine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLayout {
    ids: Vec<RowId>,
    capacity: u32,
}

impl RowLayout {
    /// Lanes in scan order, each holding `capacity` units when full
    #[must_use]
    pub const fn new(ids: Vec<RowId>, capacity: u32) -> Self {
        Self { ids, capacity }
    }

    /// Lanes numbered `1..=count`
    #[must_use]
    pub fn numbered(count: u32, capacity: u32) -> Self {
        Self::new((1..=count).map(RowId::new).collect(), capacity)
    }

    /// Lanes in scan order
    #[must_use]
    pub fn ids(&self) -> &[RowId] {
        &self.ids
    }

    /// Units per full lane
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Units the machine holds when every lane is full
    #[must_use]
    pub fn total_capacity(&self) -> u32 {
        u32::try_from(self.ids.len())
            .unwrap_or(u32::MAX)
            .saturating_mul(self.capacity)
    }

    /// Whether `row` is one of the configured lanes
    #[must_use]
    pub fn contains(&self, row: RowId) -> bool {
        self.ids.contains(&row)
    }

    /// Current counters of a lane, treating a lane absent from the document as full
    #[must_use]
    pub fn row_or_full(&self, state: &MachineState, row: RowId) -> Row {
        state
            .rows
            .get(&row)
            .cloned()
            .unwrap_or_else(|| Row::full(self.capacity))
    }

    /// Units left across all configured lanes
    #[must_use]
    pub fn remaining_units(&self, state: &MachineState) -> u64 {
        self.ids
            .iter()
            .map(|id| u64::from(self.row_or_full(state, *id).remaining))
            .sum()
    }
}

impl Default for RowLayout {
    /// Four lanes of five units
    fn default() -> Self {
        Self::numbered(4, 5)
    }
}

/// What to do with a request for more units than the machine holds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Serve at most the installed capacity
    #[default]
    Clamp,
    /// Fail the whole order
    Reject,
}

impl fmt::Display for OversizePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clamp => f.write_str("clamp"),
            Self::Reject => f.write_str("reject"),
        }
    }
}

impl FromStr for OversizePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clamp" => Ok(Self::Clamp),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown oversize policy '{other}' (expected clamp or reject)")),
        }
    }
}

/// Successful result of [`allocate`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// Units were reserved; `state` is the document to commit
    Reserved {
        /// Updated machine document
        state: MachineState,
        /// One lane per reserved unit
        rows: Vec<RowId>,
    },
    /// The order was already recorded; nothing to commit
    Existing {
        /// Lanes recorded for the order
        rows: Vec<RowId>,
    },
}

impl Allocation {
    /// Lanes reserved for the order
    #[must_use]
    pub fn rows(&self) -> &[RowId] {
        match self {
            Self::Reserved { rows, .. } | Self::Existing { rows } => rows,
        }
    }
}

/// Why an order could not be allocated
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum AllocationFailure {
    /// Every lane ran empty before the order was fully reserved
    #[error("All rows are empty. Please contact support.")]
    RowsExhausted {
        /// Units the order needed
        requested: u32,
        /// Units left in the machine when the scan gave up
        available: u64,
    },

    /// The order asked for more than the machine can ever hold
    #[error("Only {capacity} packets fit in the machine; {requested} were requested.")]
    ExceedsCapacity {
        /// Units the order asked for
        requested: u32,
        /// Installed capacity
        capacity: u32,
    },
}

impl AllocationFailure {
    /// Short label for metrics and logs
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::RowsExhausted { .. } => "rows_exhausted",
            Self::ExceedsCapacity { .. } => "exceeds_capacity",
        }
    }
}

/// Normalise a requested quantity to what one order may reserve.
///
/// Zero becomes one. Quantities above the installed capacity are clamped or
/// rejected according to `policy`.
///
/// # Errors
///
/// Returns [`AllocationFailure::ExceedsCapacity`] under [`OversizePolicy::Reject`].
pub fn normalize_quantity(
    requested: u32,
    layout: &RowLayout,
    policy: OversizePolicy,
) -> Result<u32, AllocationFailure> {
    let capacity = layout.total_capacity();
    if requested > capacity && policy == OversizePolicy::Reject {
        return Err(AllocationFailure::ExceedsCapacity {
            requested,
            capacity,
        });
    }
    Ok(requested.min(capacity).max(1))
}

/// Reserve `requested` units for `order_id`.
///
/// An order id already in the ledger returns its recorded lanes and touches
/// nothing. Otherwise each unit is taken from the first lane with stock,
/// scanning round-robin from `next_row`; the pointer ends one past the last
/// lane used.
///
/// # Errors
///
/// - [`AllocationFailure::ExceedsCapacity`]: oversize request under `Reject`
/// - [`AllocationFailure::RowsExhausted`]: the lanes ran dry mid-order
pub fn allocate(
    state: &MachineState,
    order_id: &OrderId,
    requested: u32,
    layout: &RowLayout,
    policy: OversizePolicy,
    now: DateTime<Utc>,
) -> Result<Allocation, AllocationFailure> {
    if let Some(existing) = state.orders.get(order_id) {
        return Ok(Allocation::Existing {
            rows: existing.reserved_rows(),
        });
    }

    let quantity = normalize_quantity(requested, layout, policy)?;
    let ids = layout.ids();

    let mut working: Vec<Row> = ids.iter().map(|id| layout.row_or_full(state, *id)).collect();
    let mut pointer = state
        .next_row
        .and_then(|next| ids.iter().position(|id| *id == next))
        .unwrap_or(0);

    let mut rows = Vec::with_capacity(quantity as usize);
    for _ in 0..quantity {
        let found = (0..ids.len())
            .map(|offset| (pointer + offset) % ids.len())
            .find(|index| working[*index].remaining > 0);

        let Some(index) = found else {
            return Err(AllocationFailure::RowsExhausted {
                requested: quantity,
                available: layout.remaining_units(state),
            });
        };

        let row = &mut working[index];
        row.remaining -= 1;
        row.dispensed_count += 1;
        row.last_updated = Some(now);

        rows.push(ids[index]);
        pointer = (index + 1) % ids.len();
    }

    let mut next = state.clone();
    for (id, row) in ids.iter().zip(working) {
        next.rows.insert(*id, row);
    }
    next.next_row = ids.get(pointer).copied();
    next.orders.insert(
        order_id.clone(),
        OrderRecord {
            row: rows[0],
            rows: rows.clone(),
            quantity,
            paid: true,
            dispensed: false,
            created_at: now,
        },
    );

    Ok(Allocation::Reserved { state: next, rows })
}
