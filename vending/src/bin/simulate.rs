//! Vending Machine Simulation
//!
//! Drives a burst of concurrent checkouts against an in-memory machine:
//! - Payment orders are created and confirmed concurrently
//! - Rows are reserved transactionally (no unit is handed out twice)
//! - Some payments fail at the gateway
//! - The last reserved order is dispensed
//!
//! Then prints the status view, the recent activity feed and the machine
//! document.
//!
//! # Usage
//!
//! ```bash
//! VENDING_ROW_CAPACITY=3 cargo run --bin simulate -- 12
//! ```
//!
//! The optional argument is the number of buyers (default 8).

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vending_core::environment::SystemClock;
use vending_runtime::memory::{InMemoryDocumentStore, InMemoryEventLog};
use vending_runtime::metrics::MetricsServer;
use vending_machine::{
    CheckoutAction, CheckoutEnvironment, CheckoutReducer, CheckoutState, CheckoutStore, LogEntry,
    MachineState, OrderId, VendingConfig, recent_activity,
};

const DEFAULT_BUYERS: usize = 8;
const WAIT: Duration = Duration::from_secs(5);

/// One simulated buyer
struct Buyer {
    order_id: OrderId,
    quantity: u32,
    pays: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = VendingConfig::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start()?;
    }

    let buyers: usize = match std::env::args().nth(1) {
        Some(raw) => raw.parse()?,
        None => DEFAULT_BUYERS,
    };

    println!("\n============================================");
    println!("   Vending Machine - Checkout Simulation");
    println!("============================================\n");
    println!(
        "Machine {}: {} rows x {} units, {} buyers\n",
        config.machine_path,
        config.layout.ids().len(),
        config.layout.capacity(),
        buyers
    );

    let document = Arc::new(InMemoryDocumentStore::<MachineState>::empty(
        config.machine_path.clone(),
    ));
    let log = Arc::new(InMemoryEventLog::<LogEntry>::new(config.log_path()));
    let env = CheckoutEnvironment::from_config(
        &config,
        document,
        Arc::clone(&log) as _,
        Arc::new(SystemClock),
    );
    let machine = env.machine.clone();
    let pricing = env.pricing.clone();

    let store: CheckoutStore = CheckoutStore::new(CheckoutState::default(), CheckoutReducer::new(), env);

    let plan: Vec<Buyer> = {
        let mut rng = rand::thread_rng();
        (0..buyers)
            .map(|n| Buyer {
                order_id: OrderId::new(format!("order_{n:03}")),
                quantity: rng.gen_range(1..=3),
                pays: !rng.gen_bool(0.15),
            })
            .collect()
    };

    // ========== Checkouts ==========

    let mut tasks = JoinSet::new();
    for buyer in plan {
        let store = store.clone();
        let amount_minor = pricing.quote(buyer.quantity);

        tasks.spawn(async move {
            store
                .send(CheckoutAction::PaymentCreated {
                    order_id: buyer.order_id.clone(),
                    quantity: buyer.quantity,
                    amount_minor,
                })
                .await?;

            if !buyer.pays {
                store
                    .send(CheckoutAction::PaymentFailed {
                        order_id: buyer.order_id.clone(),
                        quantity: buyer.quantity,
                        amount_minor,
                        description: Some("Card declined".to_string()),
                    })
                    .await?;
                return Ok((buyer.order_id, None));
            }

            let target = buyer.order_id.clone();
            let outcome = store
                .send_and_wait_for(
                    CheckoutAction::PaymentSucceeded {
                        order_id: buyer.order_id.clone(),
                        quantity: buyer.quantity,
                        amount_minor,
                    },
                    move |action| action.is_reservation_outcome() && action.order_id() == &target,
                    WAIT,
                )
                .await?;

            Ok::<_, vending_runtime::StoreError>((buyer.order_id, Some(outcome)))
        });
    }

    let mut last_reserved = None;
    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok((order_id, Some(CheckoutAction::ReservationCompleted { rows, .. }))) => {
                println!("   ✓ {order_id}: rows {rows:?}");
                last_reserved = Some(order_id);
            },
            Ok((order_id, Some(CheckoutAction::ReservationFailed { message, .. }))) => {
                println!("   ✗ {order_id}: {message}");
            },
            Ok((order_id, _)) => println!("   ✗ {order_id}: payment failed"),
            Err(error) => println!("   ✗ checkout error: {error}"),
        }
    }

    store.settle(WAIT).await?;

    // ========== Dispense ==========

    if let Some(order_id) = last_reserved {
        println!("\nDispensing {order_id}...");
        machine.acknowledge_dispense(&order_id).await?;
    }

    // ========== Report ==========

    let view = machine.status().await;
    println!("\nStatus: {} ({}%)", view.label, view.progress);
    println!("   {}", view.description);
    for step in &view.steps {
        println!("   [{:?}] {}", step.state, step.title);
    }

    println!("\nRecent activity:");
    for entry in recent_activity(log.as_ref(), config.activity).await? {
        println!("   {entry}");
    }

    let snapshot = machine.snapshot().await?;
    println!("\nMachine document (version {}):", snapshot.version.value());
    println!("{}", serde_json::to_string_pretty(&snapshot.document)?);

    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        println!("\nMetrics:\n{rendered}");
    }

    store.shutdown(WAIT).await?;
    Ok(())
}
