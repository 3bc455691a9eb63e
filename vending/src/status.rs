//! Status projection.
//!
//! Maps whatever the machine document currently holds to the four-step
//! progress narrative shown to the buyer. Pure and read-only: the projection is
//! recomputed from scratch on every read.

use crate::types::{MachineState, MachineStatus, RowId};
use serde::Serialize;

/// Titles of the lifecycle steps, in order
pub const STEP_TITLES: [&str; 4] = [
    "Payment Confirmed",
    "Preparing Order",
    "Dispensing Chips",
    "Dispensed Successfully",
];

/// Raw fields the projection reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusInput {
    /// Machine status
    pub status: MachineStatus,
    /// Dispense instruction
    pub dispense: bool,
    /// Lanes assigned to the current order
    pub assigned_rows: Vec<RowId>,
    /// Progress reported by the machine, if any
    pub progress: Option<i32>,
    /// Reason of the last failure
    pub last_error: Option<String>,
}

impl StatusInput {
    /// Input for a machine whose document could not be read
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            status: MachineStatus::Unavailable,
            ..Self::default()
        }
    }
}

impl From<&MachineState> for StatusInput {
    fn from(state: &MachineState) -> Self {
        Self {
            status: state.status.clone(),
            dispense: state.dispense,
            assigned_rows: state.assigned_rows.clone(),
            progress: state.progress,
            last_error: state.last_error.clone(),
        }
    }
}

/// Visual weight of the status badge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    /// Things are moving
    Default,
    /// Waiting on the payment
    Secondary,
    /// Something went wrong
    Destructive,
    /// No information
    Outline,
}

/// State of one lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Done
    Complete,
    /// In progress
    Active,
    /// Not reached
    Pending,
}

/// One lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Step {
    /// Step title
    pub title: &'static str,
    /// Step state
    pub state: StepState,
}

/// User-facing projection of the machine status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    /// Badge text
    pub label: &'static str,
    /// One-sentence explanation
    pub description: String,
    /// Badge weight
    pub tone: Tone,
    /// 0-100
    pub progress: u8,
    /// Current step, 0 (nothing yet) to 4 (dispensed)
    pub step: u8,
    /// The four steps with their states
    pub steps: [Step; 4],
}

/// Project the machine fields onto the lifecycle steps.
#[must_use]
pub fn derive_status(input: &StatusInput) -> StatusView {
    let status = &input.status;
    let has_rows = !input.assigned_rows.is_empty() || input.dispense;
    let complete = status.is_complete();

    let mut step = 0;
    if complete
        || matches!(
            status,
            MachineStatus::PaymentSuccess | MachineStatus::PaymentCreated | MachineStatus::Dispensing
        )
    {
        step = 1;
    }
    if has_rows {
        step = step.max(2);
    }
    if *status == MachineStatus::Dispensing {
        step = step.max(3);
    }
    if complete {
        step = 4;
    }

    let steps = std::array::from_fn(|index| {
        let number = index + 1;
        let state = if complete || number < step {
            StepState::Complete
        } else if number == step {
            StepState::Active
        } else {
            StepState::Pending
        };
        Step {
            title: STEP_TITLES[index],
            state,
        }
    });

    let progress = match input.progress {
        Some(explicit) => explicit.clamp(0, 100),
        None if complete => 100,
        None if status.is_failure() => 0,
        None if *status == MachineStatus::Dispensing => 85,
        None if has_rows => 65,
        None if *status == MachineStatus::PaymentSuccess => 40,
        None if *status == MachineStatus::PaymentCreated => 20,
        None => 10,
    };

    let (label, description, tone) = describe(status, input.last_error.as_deref());

    StatusView {
        label,
        description,
        tone,
        progress: u8::try_from(progress).unwrap_or(100),
        step: u8::try_from(step).unwrap_or(4),
        steps,
    }
}

fn describe(status: &MachineStatus, last_error: Option<&str>) -> (&'static str, String, Tone) {
    let failure = |label: &'static str, fallback: &str| {
        let description = match last_error.filter(|message| !message.trim().is_empty()) {
            Some(message) => message.to_string(),
            None => fallback.to_string(),
        };
        (label, description, Tone::Destructive)
    };

    match status {
        MachineStatus::PaymentFailed => {
            failure("Payment failed", "Payment failed. Please retry the transaction.")
        },
        MachineStatus::OutOfStock => {
            failure("Out of stock", "All rows are empty. Please contact support.")
        },
        MachineStatus::Error => failure(
            "Machine error",
            "The machine reported a fault. Contact support if this persists.",
        ),
        MachineStatus::PaymentCreated => (
            "Payment initiated",
            "We notified the dispenser about your payment.".to_string(),
            Tone::Secondary,
        ),
        MachineStatus::PaymentSuccess => (
            "Payment confirmed",
            "Vending machine received the payment successfully.".to_string(),
            Tone::Secondary,
        ),
        MachineStatus::Dispensing => (
            "Dispensing in progress",
            "The dispenser is preparing your chips right now.".to_string(),
            Tone::Default,
        ),
        MachineStatus::Dispensed | MachineStatus::Completed | MachineStatus::Done => (
            "Dispensed Successfully",
            "Collect your chips from the tray. Thanks for the purchase!".to_string(),
            Tone::Default,
        ),
        MachineStatus::Unavailable => (
            "Machine offline",
            "No data received from the vending machine.".to_string(),
            Tone::Outline,
        ),
        MachineStatus::Pending | MachineStatus::Other(_) => (
            "Awaiting update",
            "Listening for the latest status from the vending machine.".to_string(),
            Tone::Outline,
        ),
    }
}
