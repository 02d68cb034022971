//! # Local Saga Runtime Example
//!
//! An order saga that starts on `OrderPlaced`, schedules a payment deadline,
//! and cancels it when `PaymentReceived` arrives. A second order never gets
//! paid, so its deadline fires and the saga ends. Commands sent through the
//! gateway are retried while the inventory service is flaky.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --package saga-engine-local --example basic_usage
//! ```

use async_trait::async_trait;
use saga_engine_core::deadline::ScheduleToken;
use saga_engine_core::event::{EventMessage, Payload};
use saga_engine_core::port::command_bus::{CommandDispatcher, CommandMessage, DispatchError};
use saga_engine_core::saga::SagaModel;
use saga_engine_core::telemetry::TelemetryConfig;
use saga_engine_core::{RetryConfig, SagaEngineConfig};
use saga_engine_local::LocalSagaRuntime;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct OrderPlaced {
    order_id: String,
}

struct PaymentReceived {
    order_id: String,
}

struct PaymentTimeout {
    order_id: String,
}

#[derive(Default)]
struct OrderSaga {
    payment_deadline: Option<ScheduleToken>,
}

struct ReserveStock {
    order_id: String,
}

/// Fails the first two reservations with a transient error.
#[derive(Debug, Default)]
struct InventoryService {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandDispatcher for InventoryService {
    async fn dispatch(&self, command: CommandMessage) -> Result<Payload, DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= 2 {
            return Err(DispatchError::new("ConnectionReset", "inventory unavailable"));
        }
        let order_id = command
            .payload
            .downcast_ref::<ReserveStock>()
            .map(|c| c.order_id.clone())
            .unwrap_or_default();
        Ok(Payload::new(format!("stock reserved for {order_id}")))
    }
}

fn order_saga() -> SagaModel<OrderSaga> {
    SagaModel::builder("OrderSaga", OrderSaga::default)
        .start_on(
            "orderId",
            |e: &OrderPlaced| e.order_id.clone(),
            |saga, event, lifecycle| {
                let token = lifecycle.schedule_deadline(
                    Duration::from_millis(500),
                    PaymentTimeout {
                        order_id: event.order_id.clone(),
                    },
                )?;
                saga.payment_deadline = Some(token);
                Ok(())
            },
        )
        .end_on(
            "orderId",
            |e: &PaymentReceived| e.order_id.clone(),
            |saga, _, lifecycle| {
                if let Some(token) = saga.payment_deadline.take() {
                    lifecycle.cancel_deadline(&token);
                }
                Ok(())
            },
        )
        .on_deadline::<PaymentTimeout, _>(|_, timeout, lifecycle| {
            println!("   Payment for {} timed out", timeout.order_id);
            lifecycle.end();
            Ok(())
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting Local Saga Runtime Example\n");

    let inventory = Arc::new(InventoryService::default());
    let config = SagaEngineConfig::default().with_retry(
        RetryConfig::default()
            .with_retry_interval(Duration::from_millis(50))
            .with_max_retry_count(3)
            .with_retryable_kind("ConnectionReset"),
    );
    let runtime = LocalSagaRuntime::builder()
        .with_config(config)
        .with_dispatcher(inventory.clone())
        .with_in_memory_deadline_store()
        .with_telemetry(TelemetryConfig::default().with_log_level("warn"))
        .build()?;
    let sagas = runtime.saga_manager(order_saga());

    println!("1. Placing two orders...");
    for order_id in ["order-1", "order-2"] {
        sagas.handle(&EventMessage::new(OrderPlaced {
            order_id: order_id.to_string(),
        }));
    }
    println!(
        "   ✓ {} active saga(s), {} pending deadline(s)\n",
        sagas.active_saga_count(),
        runtime.deadline_manager().pending_count()
    );

    println!("2. Paying order-1...");
    sagas.handle(&EventMessage::new(PaymentReceived {
        order_id: "order-1".to_string(),
    }));
    println!(
        "   ✓ {} active saga(s), {} pending deadline(s)\n",
        sagas.active_saga_count(),
        runtime.deadline_manager().pending_count()
    );

    println!("3. Waiting for order-2's payment deadline...");
    tokio::time::sleep(Duration::from_millis(600)).await;
    println!("   ✓ {} active saga(s)\n", sagas.active_saga_count());

    println!("4. Reserving stock through a flaky inventory service...");
    if let Some(gateway) = runtime.command_gateway() {
        let reply = gateway
            .send(CommandMessage::new(ReserveStock {
                order_id: "order-1".to_string(),
            }))
            .await?;
        println!(
            "   ✓ {} after {} call(s)\n",
            reply.downcast_ref::<String>().map(String::as_str).unwrap_or("?"),
            inventory.calls.load(Ordering::SeqCst)
        );
    }

    runtime.deadline_manager().sync_store().await;
    if let Some(store) = runtime.deadline_store() {
        println!("5. Deadline store holds {} record(s)", store.len().await);
    }

    runtime.shutdown().await;
    println!("\nExample completed successfully!");
    Ok(())
}
