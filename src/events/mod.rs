use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Events emitted by the ledger after a unit of work commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Inventory events
    StockReceived {
        product_id: Uuid,
        batch_id: i64,
        quantity: Decimal,
        unit_cost: Decimal,
    },
    StockDeducted {
        product_id: Uuid,
        quantity: Decimal,
        reason: String,
    },
    InventoryAdjusted {
        product_id: Uuid,
        old_quantity: Decimal,
        new_quantity: Decimal,
        reason: String,
    },
    LowStock {
        product_id: Uuid,
        quantity: Decimal,
        min_quantity: Decimal,
    },

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),
}

/// Drains the event channel, logging each event as it arrives.
///
/// Consumers that need side effects (notifications, reorder emails) replace
/// this loop with their own receiver.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::LowStock {
                product_id,
                quantity,
                min_quantity,
            } => {
                warn!(
                    %product_id,
                    %quantity,
                    %min_quantity,
                    "Product at or below reorder threshold"
                );
            }
            other => info!("Received event: {:?}", other),
        }
    }

    info!("Event processing loop stopped");
}
