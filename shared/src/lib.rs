use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Routing key published by the order service when an order is placed.
pub const ORDER_CREATED: &str = "order.created";

/// Routing key published by the order service when an order is cancelled.
pub const ORDER_CANCELLED: &str = "order.cancelled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: String,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub order_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    Created(OrderCreatedEvent),
    Cancelled(OrderCancelledEvent),
}

#[derive(Debug, Error)]
pub enum OrderEventError {
    #[error("unknown routing key: {0}")]
    UnknownRoutingKey(String),
    #[error("malformed {routing_key} payload: {source}")]
    Malformed {
        routing_key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl OrderEvent {
    /// Decodes a raw message body according to the routing key it arrived on.
    pub fn decode(routing_key: &str, payload: &[u8]) -> Result<Self, OrderEventError> {
        let malformed = |source| OrderEventError::Malformed {
            routing_key: routing_key.to_string(),
            source,
        };

        match routing_key {
            ORDER_CREATED => serde_json::from_slice(payload)
                .map(OrderEvent::Created)
                .map_err(malformed),
            ORDER_CANCELLED => serde_json::from_slice(payload)
                .map(OrderEvent::Cancelled)
                .map_err(malformed),
            other => Err(OrderEventError::UnknownRoutingKey(other.to_string())),
        }
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            OrderEvent::Created(_) => ORDER_CREATED,
            OrderEvent::Cancelled(_) => ORDER_CANCELLED,
        }
    }

    pub fn order_id(&self) -> &str {
        match self {
            OrderEvent::Created(event) => &event.order_id,
            OrderEvent::Cancelled(event) => &event.order_id,
        }
    }

    /// Key under which a handled event is remembered, so redeliveries can be skipped.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.routing_key(), self.order_id())
    }
}
