//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::cache::{CacheError, CacheStore};
use crate::error::{InventoryError, InventoryResult};
use crate::memory::MemoryStockRepository;
use crate::models::{ProcessedEvent, Reservation, Stock, StockMovement};
use crate::repository::StockRepository;

/// A cache whose backend is always down.
pub struct FailingCache;

#[async_trait]
impl CacheStore for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<usize, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }
}

/// Wraps the memory ledger and injects failures.
#[derive(Default)]
pub struct FaultyRepository {
    pub inner: MemoryStockRepository,
    /// Reports every product as available, like a stale read would.
    pub stale_availability: AtomicBool,
    /// Every call fails as if the database were unreachable.
    pub offline: AtomicBool,
    /// Releases of these products fail.
    pub failing_releases: Mutex<HashSet<String>>,
    /// The next reservation of each of these products fails once.
    pub transient_reservation_failures: Mutex<HashSet<String>>,
    /// Pauses the next `get_stock` after it has read: signals the first
    /// `Notify`, then waits on the second before returning.
    pub stock_read_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FaultyRepository {
    pub fn new(inner: MemoryStockRepository) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    fn guard(&self) -> InventoryResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(InventoryError::transaction(
                "acquire connection",
                "connection refused",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StockRepository for FaultyRepository {
    async fn get_stock(&self, product_id: &str) -> InventoryResult<Stock> {
        self.guard()?;
        let stock = self.inner.get_stock(product_id).await;
        let gate = self.stock_read_gate.lock().unwrap().take();
        if let Some((read_done, resume)) = gate {
            read_done.notify_one();
            resume.notified().await;
        }
        stock
    }

    async fn update_stock(
        &self,
        product_id: &str,
        delta: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        self.guard()?;
        self.inner.update_stock(product_id, delta, reason).await
    }

    async fn adjust_stock(
        &self,
        product_id: &str,
        new_total: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        self.guard()?;
        self.inner.adjust_stock(product_id, new_total, reason).await
    }

    async fn check_availability(&self, product_id: &str, quantity: i32) -> InventoryResult<bool> {
        self.guard()?;
        if self.stale_availability.load(Ordering::SeqCst) {
            return Ok(true);
        }
        self.inner.check_availability(product_id, quantity).await
    }

    async fn create_reservation(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> InventoryResult<Reservation> {
        self.guard()?;
        if self
            .transient_reservation_failures
            .lock()
            .unwrap()
            .remove(product_id)
        {
            return Err(InventoryError::transaction("reserve", "deadlock detected"));
        }
        self.inner
            .create_reservation(order_id, product_id, quantity, expires_at)
            .await
    }

    async fn commit_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        self.guard()?;
        self.inner.commit_reservations(order_id).await
    }

    async fn release_reservations(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        self.guard()?;
        let blocked = {
            let failing = self.failing_releases.lock().unwrap();
            product_id.is_some_and(|p| failing.contains(p))
        };
        if blocked {
            return Err(InventoryError::transaction("release", "lock wait timeout"));
        }
        self.inner
            .release_reservations(order_id, product_id, reason)
            .await
    }

    async fn get_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        self.guard()?;
        self.inner.get_reservations(order_id).await
    }

    async fn get_movements(
        &self,
        product_id: &str,
        limit: i64,
        offset: i64,
    ) -> InventoryResult<Vec<StockMovement>> {
        self.guard()?;
        self.inner.get_movements(product_id, limit, offset).await
    }

    async fn expire_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> InventoryResult<Vec<Reservation>> {
        self.guard()?;
        self.inner.expire_reservations(now, limit).await
    }

    async fn is_event_processed(&self, event_key: &str) -> InventoryResult<bool> {
        self.guard()?;
        self.inner.is_event_processed(event_key).await
    }

    async fn mark_event_processed(&self, event: ProcessedEvent) -> InventoryResult<()> {
        self.guard()?;
        self.inner.mark_event_processed(event).await
    }
}
