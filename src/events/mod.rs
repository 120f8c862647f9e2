use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::{OrderStatus, PaymentMethod, PaymentStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender and its receiving end with room for `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without waiting. Events are observational; a full or closed
    /// channel is logged and the event dropped.
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!(error = %e, "domain event dropped");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderPlaced {
        order_id: Uuid,
        user_id: Uuid,
        total: Decimal,
        payment_method: PaymentMethod,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
        actor: String,
    },
    PaymentStatusChanged {
        order_id: Uuid,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
        actor: String,
    },
    ReservationsReleased {
        order_id: Uuid,
        units: i32,
        reason: String,
    },
    RefreshTokenReuseDetected {
        user_id: Uuid,
        revoked_tokens: u64,
    },
}

/// Drains the channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPlaced {
                order_id,
                user_id,
                total,
                payment_method,
            } => info!(%order_id, %user_id, %total, %payment_method, "order placed"),
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
                actor,
            } => info!(%order_id, %old_status, %new_status, %actor, "order status changed"),
            Event::PaymentStatusChanged {
                order_id,
                old_status,
                new_status,
                actor,
            } => info!(%order_id, %old_status, %new_status, %actor, "payment status changed"),
            Event::ReservationsReleased {
                order_id,
                units,
                reason,
            } => info!(%order_id, units, %reason, "reserved stock returned"),
            Event::RefreshTokenReuseDetected {
                user_id,
                revoked_tokens,
            } => warn!(%user_id, revoked_tokens, "refresh token reuse detected"),
        }
    }

    info!("Event processing loop stopped");
}
