//! # Vending Machine
//!
//! Payment-to-dispense coordination for a multi-row vending machine.
//!
//! A single versioned document describes the machine: per-row stock, the
//! round-robin pointer, every order that has been reserved and the status the
//! buyer sees. An append-only log keeps an audit trail of payment events.
//!
//! ## Flow
//!
//! ```text
//! gateway callback → CheckoutAction → CheckoutReducer
//!                                        ├── reserve rows (transactional, idempotent)
//!                                        ├── sync machine status   (best effort)
//!                                        └── append audit entry    (best effort)
//! ```
//!
//! Row allocation is the only step that decides whether a paid order gets
//! chips. It runs inside a compare-and-swap loop, so concurrent confirmations
//! never hand out the same unit twice, and replaying a confirmation returns the
//! rows already reserved.
//!
//! ## Modules
//!
//! - [`allocation`]: the pure allocation algorithm
//! - [`machine`]: transactional access to the machine document
//! - [`checkout`]: the reducer wiring payments to reservations
//! - [`status`]: the buyer-facing progress projection
//! - [`activity`]: the recent-activity feed
//! - [`config`]: environment-driven configuration

pub mod activity;
pub mod allocation;
pub mod checkout;
pub mod config;
pub mod machine;
pub mod status;
pub mod types;

pub use activity::recent_activity;
pub use allocation::{Allocation, AllocationFailure, OversizePolicy, RowLayout, allocate};
pub use checkout::{
    Checkout, CheckoutAction, CheckoutEnvironment, CheckoutPhase, CheckoutReducer, CheckoutState,
};
pub use config::{ActivityWindow, ConfigError, Pricing, VendingConfig};
pub use machine::{MachineError, MachineStore, Reservation, ReserveError, StatusUpdate};
pub use status::{StatusInput, StatusView, derive_status};
pub use types::{LogEntry, LogKind, MachineState, MachineStatus, OrderId, OrderRecord, Row, RowId};

/// Store running the checkout reducer
pub type CheckoutStore =
    vending_runtime::Store<CheckoutState, CheckoutAction, CheckoutEnvironment, CheckoutReducer>;
