use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::{Message, Offset};
use shared::{OrderEvent, ORDER_CANCELLED, ORDER_CREATED};
use tracing::{debug, error, info, warn};

use crate::engine::ReservationEngine;
use crate::error::InventoryError;
use crate::metrics::InventoryMetrics;

/// What to do with a delivered message once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Deliver again later; the failure was in infrastructure.
    Requeue,
    /// Discard without retrying; the message can never succeed.
    Drop,
}

/// Maps order events onto engine operations and decides their disposition.
pub struct OrderEventHandler {
    engine: Arc<ReservationEngine>,
    metrics: Arc<InventoryMetrics>,
}

impl OrderEventHandler {
    pub fn new(engine: Arc<ReservationEngine>, metrics: Arc<InventoryMetrics>) -> Self {
        Self { engine, metrics }
    }

    pub async fn handle(&self, routing_key: &str, payload: &[u8]) -> Disposition {
        let disposition = self.dispatch(routing_key, payload).await;
        match disposition {
            Disposition::Ack => self.metrics.event_acked(),
            Disposition::Requeue => self.metrics.event_requeued(),
            Disposition::Drop => self.metrics.event_dropped(),
        }
        disposition
    }

    async fn dispatch(&self, routing_key: &str, payload: &[u8]) -> Disposition {
        let event = match OrderEvent::decode(routing_key, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                return Disposition::Drop;
            }
        };

        let dedup_key = event.dedup_key();
        match self.engine.is_event_processed(&dedup_key).await {
            Ok(true) => {
                info!("Event {} already processed, skipping", dedup_key);
                return Disposition::Ack;
            }
            Ok(false) => {}
            Err(e) => {
                error!("Error checking processed events for {}: {}", dedup_key, e);
                return Disposition::Requeue;
            }
        }

        let outcome = match &event {
            OrderEvent::Created(created) => self
                .engine
                .reserve_stock(&created.order_id, &created.items)
                .await
                .map(|_| ()),
            OrderEvent::Cancelled(cancelled) => {
                let reason = if cancelled.reason.is_empty() {
                    "order cancelled"
                } else {
                    cancelled.reason.as_str()
                };
                match self
                    .engine
                    .release_reservation(&cancelled.order_id, reason)
                    .await
                {
                    Err(InventoryError::NotFound(_)) => {
                        info!(
                            "Order {} has nothing pending to release",
                            cancelled.order_id
                        );
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self
                    .engine
                    .mark_event_processed(dedup_key.clone(), event.order_id(), event.routing_key())
                    .await
                {
                    // reserve_stock dedups on existing reservations.
                    warn!("Failed to mark event {} as processed: {}", dedup_key, e);
                }
                Disposition::Ack
            }
            Err(e) if e.is_retryable() => {
                error!("Event {} failed, requeueing: {}", dedup_key, e);
                Disposition::Requeue
            }
            Err(e) => {
                warn!("Event {} rejected, dropping: {}", dedup_key, e);
                Disposition::Drop
            }
        }
    }
}

pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

type MessagePosition = (String, i32, i64);

/// Kafka transport for [`OrderEventHandler`]. Each routing key is consumed
/// from its own topic and offsets are committed by hand.
///
/// A requeue seeks the partition back to the message. Deliveries are counted
/// per message position and a message still failing after `max_attempts`
/// deliveries is dropped, so one poisoned event cannot stall its partition.
pub struct OrderEventSubscriber {
    handler: OrderEventHandler,
    routing_keys: HashMap<String, &'static str>,
    requeue_delay: Duration,
    max_attempts: u32,
    attempts: Mutex<HashMap<MessagePosition, u32>>,
}

impl OrderEventSubscriber {
    pub fn new(handler: OrderEventHandler, created_topic: &str, cancelled_topic: &str) -> Self {
        let routing_keys = HashMap::from([
            (created_topic.to_string(), ORDER_CREATED),
            (cancelled_topic.to_string(), ORDER_CANCELLED),
        ]);
        Self {
            handler,
            routing_keys,
            requeue_delay: Duration::from_secs(1),
            max_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn topics(&self) -> Vec<&str> {
        self.routing_keys.keys().map(String::as_str).collect()
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    let routing_key: &str = match self.routing_keys.get(m.topic()) {
                        Some(key) => key,
                        None => m.topic(),
                    };
                    let disposition = self
                        .handler
                        .handle(routing_key, m.payload().unwrap_or_default())
                        .await;
                    let disposition =
                        self.resolve(m.topic(), m.partition(), m.offset(), disposition);
                    debug!(
                        topic = m.topic(),
                        partition = m.partition(),
                        offset = m.offset(),
                        ?disposition,
                        "Handled message"
                    );
                    self.settle(&consumer, &m, disposition).await;
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    /// Turns a requeue into a drop once the message has used up its
    /// deliveries. Any other outcome forgets the message.
    fn resolve(&self, topic: &str, partition: i32, offset: i64, disposition: Disposition) -> Disposition {
        let position = (topic.to_string(), partition, offset);
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if disposition != Disposition::Requeue {
            attempts.remove(&position);
            return disposition;
        }

        let delivered = {
            let count = attempts.entry(position.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if delivered < self.max_attempts {
            return Disposition::Requeue;
        }

        attempts.remove(&position);
        error!(
            topic,
            partition,
            offset,
            attempts = delivered,
            "Message still failing after repeated deliveries, dropping"
        );
        self.handler.metrics.event_dropped();
        Disposition::Drop
    }

    async fn settle(&self, consumer: &StreamConsumer, m: &BorrowedMessage<'_>, disposition: Disposition) {
        match disposition {
            Disposition::Ack | Disposition::Drop => {
                if let Err(e) = consumer.commit_message(m, CommitMode::Async) {
                    error!("Error committing message: {}", e);
                }
            }
            Disposition::Requeue => {
                tokio::time::sleep(self.requeue_delay).await;
                if let Err(e) = consumer.seek(
                    m.topic(),
                    m.partition(),
                    Offset::Offset(m.offset()),
                    Duration::from_secs(5),
                ) {
                    error!("Error seeking back to offset {}: {}", m.offset(), e);
                }
            }
        }
    }
}
