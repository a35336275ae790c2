//! Read-through, write-invalidate cache in front of a [`StockRepository`].
//!
//! Reads consult the cache first and fill it on a miss. Every mutation drops
//! the stock key, every availability variant, and the movement pages of each
//! product it touched before returning, whether or not the mutation
//! succeeded. Cache failures are counted, logged and otherwise ignored.
//!
//! A read that misses and races a write could fill the cache with rows read
//! before the write committed. Every invalidation bumps a per-product (or
//! per-order) generation; a fill whose generation moved while it read is
//! skipped, or deleted again if the write landed between check and store.
//! Generations are process-local, so writes made by another instance are
//! only bounded by the TTLs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{keys, CacheError, CacheStore};
use crate::error::InventoryResult;
use crate::metrics::InventoryMetrics;
use crate::models::{ProcessedEvent, Reservation, Stock, StockMovement};
use crate::repository::{SharedRepository, StockRepository};

#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub stock: Duration,
    pub availability: Duration,
    pub movements: Duration,
    pub reservations: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            stock: Duration::from_secs(60),
            availability: Duration::from_secs(30),
            movements: Duration::from_secs(300),
            reservations: Duration::from_secs(60),
        }
    }
}

pub struct CachedStockRepository {
    inner: SharedRepository,
    cache: Arc<dyn CacheStore>,
    ttls: CacheTtls,
    metrics: Arc<InventoryMetrics>,
    generations: Mutex<HashMap<String, u64>>,
}

fn product_scope(product_id: &str) -> String {
    format!("product:{product_id}")
}

fn order_scope(order_id: &str) -> String {
    format!("order:{order_id}")
}

impl CachedStockRepository {
    pub fn new(
        inner: SharedRepository,
        cache: Arc<dyn CacheStore>,
        ttls: CacheTtls,
        metrics: Arc<InventoryMetrics>,
    ) -> Self {
        Self {
            inner,
            cache,
            ttls,
            metrics,
            generations: Mutex::new(HashMap::new()),
        }
    }

    fn generations(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generation(&self, scope: &str) -> u64 {
        self.generations().get(scope).copied().unwrap_or(0)
    }

    fn bump(&self, scope: &str) {
        *self.generations().entry(scope.to_string()).or_insert(0) += 1;
    }

    /// Stores a value read at generation `seen` unless a write to the scope
    /// invalidated it in the meantime.
    async fn fill<T: Serialize>(&self, scope: &str, seen: u64, key: &str, value: &T, ttl: Duration) {
        if self.generation(scope) != seen {
            debug!(key, "skipping cache fill raced by a write");
            return;
        }
        self.store(key, value, ttl).await;
        if self.generation(scope) != seen {
            self.drop_key(key).await;
        }
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let lookup = match self.cache.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).map(Some).map_err(CacheError::from),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        match lookup {
            Ok(Some(value)) => {
                self.metrics.cache_hit();
                Some(value)
            }
            Ok(None) => {
                self.metrics.cache_miss();
                None
            }
            Err(e) => {
                self.metrics.cache_error();
                warn!(key, error = %e, "cache read failed, falling back to repository");
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let result = match serde_json::to_string(value) {
            Ok(raw) => self.cache.set(key, raw, ttl).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.metrics.cache_error();
            warn!(key, error = %e, "cache write failed");
        }
    }

    async fn drop_key(&self, key: &str) {
        if let Err(e) = self.cache.delete(key).await {
            self.metrics.cache_error();
            warn!(key, error = %e, "cache invalidation failed");
        }
    }

    async fn drop_pattern(&self, pattern: &str) {
        match self.cache.delete_pattern(pattern).await {
            Ok(removed) => debug!(pattern, removed, "cache pattern invalidated"),
            Err(e) => {
                self.metrics.cache_error();
                warn!(pattern, error = %e, "cache pattern invalidation failed");
            }
        }
    }

    async fn invalidate_product(&self, product_id: &str) {
        self.bump(&product_scope(product_id));
        self.drop_key(&keys::stock(product_id)).await;
        self.drop_pattern(&keys::availability_pattern(product_id)).await;
        self.drop_pattern(&keys::movements_pattern(product_id)).await;
    }

    async fn invalidate_order_rows(&self, order_id: &str) {
        self.bump(&order_scope(order_id));
        self.drop_key(&keys::reservation(order_id)).await;
    }

    async fn invalidate_reservations(&self, reservations: &[Reservation]) {
        let mut orders: Vec<&str> = reservations.iter().map(|r| r.order_id.as_str()).collect();
        orders.sort_unstable();
        orders.dedup();
        for order_id in orders {
            self.invalidate_order_rows(order_id).await;
        }

        let mut products: Vec<&str> = reservations.iter().map(|r| r.product_id.as_str()).collect();
        products.sort_unstable();
        products.dedup();
        for product_id in products {
            self.invalidate_product(product_id).await;
        }
    }

    /// Drops the order's reservation list and every product it references,
    /// using the rows the repository reports after the write.
    async fn invalidate_order(&self, order_id: &str) {
        self.invalidate_order_rows(order_id).await;
        match self.inner.get_reservations(order_id).await {
            Ok(rows) => self.invalidate_reservations(&rows).await,
            Err(e) => warn!(order_id, error = %e, "could not list reservations to invalidate"),
        }
    }
}

#[async_trait]
impl StockRepository for CachedStockRepository {
    async fn get_stock(&self, product_id: &str) -> InventoryResult<Stock> {
        let key = keys::stock(product_id);
        if let Some(stock) = self.cached::<Stock>(&key).await {
            return Ok(stock);
        }

        let scope = product_scope(product_id);
        let seen = self.generation(&scope);
        let stock = self.inner.get_stock(product_id).await?;
        self.fill(&scope, seen, &key, &stock, self.ttls.stock).await;
        Ok(stock)
    }

    async fn update_stock(
        &self,
        product_id: &str,
        delta: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        let result = self.inner.update_stock(product_id, delta, reason).await;
        self.invalidate_product(product_id).await;
        result
    }

    async fn adjust_stock(
        &self,
        product_id: &str,
        new_total: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        let result = self.inner.adjust_stock(product_id, new_total, reason).await;
        self.invalidate_product(product_id).await;
        result
    }

    async fn check_availability(&self, product_id: &str, quantity: i32) -> InventoryResult<bool> {
        let key = keys::availability(product_id, quantity);
        if let Some(available) = self.cached::<bool>(&key).await {
            return Ok(available);
        }

        let scope = product_scope(product_id);
        let seen = self.generation(&scope);
        let available = self.inner.check_availability(product_id, quantity).await?;
        self.fill(&scope, seen, &key, &available, self.ttls.availability)
            .await;
        Ok(available)
    }

    async fn create_reservation(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> InventoryResult<Reservation> {
        let result = self
            .inner
            .create_reservation(order_id, product_id, quantity, expires_at)
            .await;
        self.invalidate_order_rows(order_id).await;
        self.invalidate_product(product_id).await;
        result
    }

    async fn commit_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        let result = self.inner.commit_reservations(order_id).await;
        match &result {
            Ok(settled) => {
                self.invalidate_order_rows(order_id).await;
                self.invalidate_reservations(settled).await;
            }
            Err(_) => self.invalidate_order(order_id).await,
        }
        result
    }

    async fn release_reservations(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        let result = self
            .inner
            .release_reservations(order_id, product_id, reason)
            .await;
        match &result {
            Ok(settled) => {
                self.invalidate_order_rows(order_id).await;
                self.invalidate_reservations(settled).await;
            }
            Err(_) => self.invalidate_order(order_id).await,
        }
        result
    }

    async fn get_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        let key = keys::reservation(order_id);
        if let Some(rows) = self.cached::<Vec<Reservation>>(&key).await {
            return Ok(rows);
        }

        let scope = order_scope(order_id);
        let seen = self.generation(&scope);
        let rows = self.inner.get_reservations(order_id).await?;
        self.fill(&scope, seen, &key, &rows, self.ttls.reservations).await;
        Ok(rows)
    }

    async fn get_movements(
        &self,
        product_id: &str,
        limit: i64,
        offset: i64,
    ) -> InventoryResult<Vec<StockMovement>> {
        let key = keys::movements(product_id, limit, offset);
        if let Some(rows) = self.cached::<Vec<StockMovement>>(&key).await {
            return Ok(rows);
        }

        let scope = product_scope(product_id);
        let seen = self.generation(&scope);
        let rows = self.inner.get_movements(product_id, limit, offset).await?;
        self.fill(&scope, seen, &key, &rows, self.ttls.movements).await;
        Ok(rows)
    }

    async fn expire_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> InventoryResult<Vec<Reservation>> {
        let expired = self.inner.expire_reservations(now, limit).await?;
        self.invalidate_reservations(&expired).await;
        Ok(expired)
    }

    async fn is_event_processed(&self, event_key: &str) -> InventoryResult<bool> {
        self.inner.is_event_processed(event_key).await
    }

    async fn mark_event_processed(&self, event: ProcessedEvent) -> InventoryResult<()> {
        self.inner.mark_event_processed(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::memory::MemoryStockRepository;
    use crate::testing::{FailingCache, FaultyRepository};
    use tokio::sync::Notify;

    fn cached_over(
        inner: MemoryStockRepository,
        cache: Arc<dyn CacheStore>,
    ) -> (CachedStockRepository, Arc<InventoryMetrics>) {
        let metrics = Arc::new(InventoryMetrics::new());
        let repo = CachedStockRepository::new(
            Arc::new(inner),
            cache,
            CacheTtls::default(),
            metrics.clone(),
        );
        (repo, metrics)
    }

    #[tokio::test]
    async fn reads_after_write_are_never_stale() {
        let cache = Arc::new(MemoryCache::new());
        let (repo, metrics) = cached_over(MemoryStockRepository::new(), cache.clone());

        assert_eq!(repo.get_stock("P").await.unwrap().available, 0);
        assert_eq!(repo.get_stock("P").await.unwrap().available, 0);
        assert_eq!(metrics.snapshot().cache_hits, 1);
        assert!(cache.contains(&keys::stock("P")));

        repo.update_stock("P", 100, "initial load").await.unwrap();

        assert!(!cache.contains(&keys::stock("P")));
        assert_eq!(repo.get_stock("P").await.unwrap().available, 100);
    }

    #[tokio::test]
    async fn reservation_drops_every_availability_variant() {
        let cache = Arc::new(MemoryCache::new());
        let inner = MemoryStockRepository::new();
        inner.update_stock("P", 10, "seed").await.unwrap();
        let (repo, _) = cached_over(inner, cache.clone());

        assert!(repo.check_availability("P", 5).await.unwrap());
        assert!(repo.check_availability("P", 10).await.unwrap());
        assert!(cache.contains(&keys::availability("P", 10)));

        repo.create_reservation("O1", "P", 6, Utc::now() + chrono::Duration::minutes(30))
            .await
            .unwrap();

        assert!(!cache.contains(&keys::availability("P", 5)));
        assert!(!cache.contains(&keys::availability("P", 10)));
        assert!(!repo.check_availability("P", 10).await.unwrap());
        assert_eq!(repo.get_reservations("O1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_refreshes_order_and_history() {
        let cache = Arc::new(MemoryCache::new());
        let inner = MemoryStockRepository::new();
        inner.update_stock("P", 10, "seed").await.unwrap();
        let (repo, _) = cached_over(inner, cache.clone());

        repo.create_reservation("O1", "P", 4, Utc::now() + chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(repo.get_movements("P", 20, 0).await.unwrap().len(), 2);
        assert_eq!(repo.get_reservations("O1").await.unwrap()[0].status, "PENDING");

        repo.commit_reservations("O1").await.unwrap();

        assert!(!cache.contains(&keys::reservation("O1")));
        assert!(!cache.contains(&keys::movements("P", 20, 0)));
        assert_eq!(repo.get_reservations("O1").await.unwrap()[0].status, "COMMITTED");
        let history = repo.get_movements("P", 20, 0).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].movement_type, "COMMITTED");
    }

    #[tokio::test]
    async fn broken_cache_never_fails_the_ledger() {
        let (repo, metrics) = cached_over(MemoryStockRepository::new(), Arc::new(FailingCache));

        let stock = repo.update_stock("P", 7, "seed").await.unwrap();
        assert_eq!(stock.total, 7);
        assert_eq!(repo.get_stock("P").await.unwrap().total, 7);
        assert!(repo.check_availability("P", 7).await.unwrap());

        assert!(metrics.snapshot().cache_errors > 0);
        assert_eq!(metrics.snapshot().cache_hits, 0);
    }

    #[tokio::test]
    async fn fill_that_raced_a_write_is_not_kept() {
        let memory = MemoryStockRepository::new();
        memory.update_stock("P", 5, "seed").await.unwrap();
        let faulty = FaultyRepository::new(memory);
        let read_done = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        *faulty.stock_read_gate.lock().unwrap() = Some((read_done.clone(), resume.clone()));
        let cache = Arc::new(MemoryCache::new());
        let repo = Arc::new(CachedStockRepository::new(
            Arc::new(faulty),
            cache.clone(),
            CacheTtls::default(),
            Arc::new(InventoryMetrics::new()),
        ));

        let reader = tokio::spawn({
            let repo = repo.clone();
            async move { repo.get_stock("P").await }
        });
        read_done.notified().await;
        repo.update_stock("P", 10, "restock").await.unwrap();
        resume.notify_one();

        let stale = reader.await.unwrap().unwrap();
        assert_eq!(stale.available, 5);
        assert!(!cache.contains(&keys::stock("P")));
        assert_eq!(repo.get_stock("P").await.unwrap().available, 15);
        assert!(cache.contains(&keys::stock("P")));
    }
}
