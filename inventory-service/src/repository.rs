use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::InventoryResult;
use crate::models::{ProcessedEvent, Reservation, Stock, StockMovement};

/// Transactional access to the stock ledger.
///
/// Every mutating method runs under the per-product lock of each product it
/// touches and writes its stock update, reservation change and movement
/// atomically. Methods touching several products take their locks in
/// ascending product-id order.
#[async_trait]
pub trait StockRepository: Send + Sync {
    /// Returns the product's stock, creating a zeroed row on first access.
    async fn get_stock(&self, product_id: &str) -> InventoryResult<Stock>;

    async fn update_stock(&self, product_id: &str, delta: i32, reason: &str)
        -> InventoryResult<Stock>;

    async fn adjust_stock(&self, product_id: &str, new_total: i32, reason: &str)
        -> InventoryResult<Stock>;

    async fn check_availability(&self, product_id: &str, quantity: i32) -> InventoryResult<bool> {
        Ok(self.get_stock(product_id).await?.available >= quantity)
    }

    async fn create_reservation(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> InventoryResult<Reservation>;

    /// Commits every PENDING reservation of the order. Fails with `NotFound`
    /// when there is none.
    async fn commit_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>>;

    /// Releases the order's PENDING reservations, or only the one for
    /// `product_id` when given. Fails with `NotFound` when nothing matches.
    async fn release_reservations(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>>;

    async fn get_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>>;

    /// Newest first.
    async fn get_movements(
        &self,
        product_id: &str,
        limit: i64,
        offset: i64,
    ) -> InventoryResult<Vec<StockMovement>>;

    /// Expires up to `limit` PENDING reservations whose deadline is at or
    /// before `now`, returning their quantity to `available`.
    async fn expire_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> InventoryResult<Vec<Reservation>>;

    async fn is_event_processed(&self, event_key: &str) -> InventoryResult<bool>;

    /// Recording an already recorded key is a no-op.
    async fn mark_event_processed(&self, event: ProcessedEvent) -> InventoryResult<()>;
}

pub type SharedRepository = Arc<dyn StockRepository>;
