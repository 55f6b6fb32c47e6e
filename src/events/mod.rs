use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle moments the engine announces. Consumers (the notification
/// dispatcher among them) key on [`Event::name`]; the full variant serializes
/// into the data payload via [`Event::payload`].
///
/// Events are emitted only after the owning transaction commits, so a failed
/// delivery can never roll back committed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated {
        cart_id: Uuid,
    },
    CartsMerged {
        guest_cart_id: Uuid,
        customer_cart_id: Uuid,
    },
    CouponApplied {
        cart_id: Uuid,
        coupon_id: Uuid,
        code: String,
    },
    CouponRemoved {
        cart_id: Uuid,
    },

    // Order events
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderNoteAdded {
        order_id: Uuid,
    },
    OrderRefunded {
        order_id: Uuid,
        amount: Decimal,
        full: bool,
    },

    // Payment events
    PaymentCreated {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentCaptured {
        payment_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    PaymentFailed {
        payment_id: Uuid,
        order_id: Uuid,
    },

    // Refund events
    RefundRequested {
        refund_id: Uuid,
        payment_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    RefundCompleted {
        refund_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    RefundFailed {
        refund_id: Uuid,
        order_id: Uuid,
    },

    // Inventory events
    StockRestored {
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
}

impl Event {
    /// Dotted lifecycle name dispatchers route on.
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartCreated { .. } => "cart.created",
            Event::CartsMerged { .. } => "cart.merged",
            Event::CouponApplied { .. } => "coupon.applied",
            Event::CouponRemoved { .. } => "coupon.removed",
            Event::OrderCreated { .. } => "order.created",
            Event::OrderStatusChanged { new_status, .. } => match new_status.as_str() {
                "processing" => "order.processing",
                "shipped" => "order.shipped",
                "delivered" => "order.delivered",
                "on_hold" => "order.on_hold",
                "cancelled" => "order.cancelled",
                _ => "order.updated",
            },
            Event::OrderNoteAdded { .. } => "order.note_added",
            Event::OrderRefunded { full: true, .. } => "order.refunded",
            Event::OrderRefunded { full: false, .. } => "order.partially_refunded",
            Event::PaymentCreated { .. } => "payment.created",
            Event::PaymentCaptured { .. } => "payment.captured",
            Event::PaymentFailed { .. } => "payment.failed",
            Event::RefundRequested { .. } => "refund.requested",
            Event::RefundCompleted { .. } => "refund.completed",
            Event::RefundFailed { .. } => "refund.failed",
            Event::StockRestored { .. } => "stock.restored",
        }
    }

    /// Data payload delivered alongside the name.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

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

    /// Fire-and-forget send. Delivery failure (full or closed channel) is
    /// logged and swallowed; callers have already committed and must not
    /// fail because nobody is listening.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, "failed to publish event: {}", e);
        }
    }
}

/// Builds the channel ends used to wire services to the processing loop.
pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

// Handlers implementing this trait process events asynchronously; the
// notification dispatcher the embedding application supplies is one of them.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Drains the channel and fans each event out to every registered handler.
/// Handler failures are logged and do not stop the loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let name = event.name();
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.handle_event(event.clone())),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                warn!(event = name, "event handler failed: {}", e);
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: Event) -> Result<(), String> {
            self.seen.lock().await.push(event.name().to_string());
            Ok(())
        }
    }

    #[test]
    fn status_change_events_map_to_dotted_names() {
        let event = Event::OrderStatusChanged {
            order_id: Uuid::new_v4(),
            old_status: "pending".into(),
            new_status: "processing".into(),
        };
        assert_eq!(event.name(), "order.processing");

        let event = Event::OrderRefunded {
            order_id: Uuid::new_v4(),
            amount: Decimal::new(4000, 2),
            full: false,
        };
        assert_eq!(event.name(), "order.partially_refunded");
    }

    #[test]
    fn payload_round_trips_through_json() {
        let event = Event::CartCreated {
            cart_id: Uuid::new_v4(),
        };
        let payload = event.payload();
        assert!(payload.get("CartCreated").is_some());
    }

    #[tokio::test]
    async fn send_or_log_survives_a_dropped_receiver() {
        let (sender, rx) = event_channel(4);
        drop(rx);
        // Must not panic or error out
        sender
            .send_or_log(Event::CartCreated {
                cart_id: Uuid::new_v4(),
            })
            .await;
    }

    #[tokio::test]
    async fn process_events_fans_out_to_handlers() {
        let (sender, rx) = event_channel(8);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let handle = tokio::spawn(process_events(rx, vec![recorder.clone()]));

        sender
            .send_or_log(Event::CartCreated {
                cart_id: Uuid::new_v4(),
            })
            .await;
        sender
            .send_or_log(Event::OrderCreated {
                order_id: Uuid::new_v4(),
                order_number: "ORD-TEST0001".into(),
                total: Decimal::new(10000, 2),
            })
            .await;

        drop(sender);
        handle.await.expect("event loop task failed");

        let seen = recorder.seen.lock().await;
        assert_eq!(seen.as_slice(), ["cart.created", "order.created"]);
    }
}
