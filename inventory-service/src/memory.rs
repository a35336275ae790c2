//! In-process ledger for tests and database-less runs.
//!
//! Product locks are async mutexes kept in a per-key map. A mutating
//! operation holds the lock of every product it touches while its closure
//! runs against a staged view of the state; staged writes land in the shared
//! state only when the closure returns `Ok`, so a failed operation leaves no
//! trace.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::{InventoryError, InventoryResult};
use crate::ledger::{Settlement, EXPIRY_REASON, ORDER_REFERENCE};
use crate::models::*;
use crate::repository::StockRepository;

#[derive(Debug, Default)]
struct State {
    stocks: HashMap<String, Stock>,
    reservations: Vec<Reservation>,
    movements: Vec<StockMovement>,
    processed: HashMap<String, ProcessedEvent>,
}

/// Staged writes of one locked operation.
pub struct MemoryTx<'a> {
    state: &'a State,
    warehouse_id: &'a str,
    stocks: HashMap<String, Stock>,
    reservations: Vec<Reservation>,
    movements: Vec<StockMovement>,
}

impl<'a> MemoryTx<'a> {
    fn new(state: &'a State, warehouse_id: &'a str) -> Self {
        Self {
            state,
            warehouse_id,
            stocks: HashMap::new(),
            reservations: Vec::new(),
            movements: Vec::new(),
        }
    }

    pub fn stock(&self, product_id: &str) -> Stock {
        self.stocks
            .get(product_id)
            .or_else(|| self.state.stocks.get(product_id))
            .cloned()
            .unwrap_or_else(|| Stock::empty(product_id, self.warehouse_id))
    }

    pub fn put_stock(&mut self, stock: Stock) {
        self.stocks.insert(stock.product_id.clone(), stock);
    }

    pub fn reservations_for(&self, order_id: &str) -> Vec<Reservation> {
        let mut rows: Vec<Reservation> = self
            .state
            .reservations
            .iter()
            .filter(|r| r.order_id == order_id)
            .map(|r| {
                self.reservations
                    .iter()
                    .find(|staged| staged.id == r.id)
                    .unwrap_or(r)
                    .clone()
            })
            .collect();
        rows.extend(
            self.reservations
                .iter()
                .filter(|staged| staged.order_id == order_id)
                .filter(|staged| !self.state.reservations.iter().any(|r| r.id == staged.id))
                .cloned(),
        );
        rows.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        rows
    }

    pub fn put_reservation(&mut self, reservation: Reservation) {
        self.reservations.retain(|r| r.id != reservation.id);
        self.reservations.push(reservation);
    }

    pub fn record(&mut self, movement: StockMovement) {
        self.movements.push(movement);
    }

    fn into_writes(self) -> Writes {
        Writes {
            stocks: self.stocks,
            reservations: self.reservations,
            movements: self.movements,
        }
    }
}

struct Writes {
    stocks: HashMap<String, Stock>,
    reservations: Vec<Reservation>,
    movements: Vec<StockMovement>,
}

impl State {
    fn apply(&mut self, writes: Writes) {
        self.stocks.extend(writes.stocks);
        for reservation in writes.reservations {
            match self.reservations.iter_mut().find(|r| r.id == reservation.id) {
                Some(existing) => *existing = reservation,
                None => self.reservations.push(reservation),
            }
        }
        self.movements.extend(writes.movements);
    }
}

#[derive(Clone)]
pub struct MemoryStockRepository {
    state: Arc<Mutex<State>>,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    warehouse_id: String,
}

impl Default for MemoryStockRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStockRepository {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            warehouse_id: DEFAULT_WAREHOUSE.to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn product_lock(&self, product_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(product_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn lock_products(&self, product_ids: &BTreeSet<String>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(product_ids.len());
        for product_id in product_ids {
            guards.push(self.product_lock(product_id).lock_owned().await);
        }
        guards
    }

    fn run<T>(&self, f: impl FnOnce(&mut MemoryTx<'_>) -> InventoryResult<T>) -> InventoryResult<T> {
        let mut state = self.state();
        let (value, writes) = {
            let mut tx = MemoryTx::new(&state, &self.warehouse_id);
            let value = f(&mut tx)?;
            (value, tx.into_writes())
        };
        state.apply(writes);
        Ok(value)
    }

    /// Runs `f` while holding the product's lock.
    pub async fn with_product_lock<T>(
        &self,
        product_id: &str,
        f: impl FnOnce(&mut MemoryTx<'_>) -> InventoryResult<T>,
    ) -> InventoryResult<T> {
        let lock = self.product_lock(product_id);
        let _guard = lock.lock().await;
        self.run(f)
    }

    /// Locks every product with a PENDING reservation on the order (in
    /// ascending order) and settles them in one step.
    async fn settle_order(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        settlement: Settlement,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        let is_target = |r: &Reservation| {
            r.order_id == order_id
                && r.is_pending()
                && product_id.map_or(true, |p| r.product_id == p)
        };

        loop {
            let products: BTreeSet<String> = self
                .state()
                .reservations
                .iter()
                .filter(|r| is_target(*r))
                .map(|r| r.product_id.clone())
                .collect();
            if products.is_empty() {
                return Err(InventoryError::NotFound(format!(
                    "pending reservation for order {order_id}"
                )));
            }

            let _guards = self.lock_products(&products).await;

            // A reservation for another product may have appeared while we
            // waited for the locks; start over so it gets locked too.
            let current: BTreeSet<String> = self
                .state()
                .reservations
                .iter()
                .filter(|r| is_target(*r))
                .map(|r| r.product_id.clone())
                .collect();
            if !current.is_subset(&products) {
                continue;
            }

            return self.run(|tx| {
                let pending: Vec<Reservation> = tx
                    .reservations_for(order_id)
                    .into_iter()
                    .filter(|r| is_target(r))
                    .collect();
                if pending.is_empty() {
                    return Err(InventoryError::NotFound(format!(
                        "pending reservation for order {order_id}"
                    )));
                }

                let mut settled = Vec::with_capacity(pending.len());
                for mut reservation in pending {
                    let mut stock = tx.stock(&reservation.product_id);
                    let movement = settlement.apply(&mut stock, &mut reservation, reason)?;
                    tx.put_stock(stock);
                    tx.put_reservation(reservation.clone());
                    tx.record(movement);
                    settled.push(reservation);
                }
                Ok(settled)
            });
        }
    }

    /// Every movement recorded for the product, oldest first.
    pub fn movements(&self, product_id: &str) -> Vec<StockMovement> {
        self.state()
            .movements
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StockRepository for MemoryStockRepository {
    async fn get_stock(&self, product_id: &str) -> InventoryResult<Stock> {
        let mut state = self.state();
        let stock = state
            .stocks
            .entry(product_id.to_string())
            .or_insert_with(|| Stock::empty(product_id, &self.warehouse_id));
        Ok(stock.clone())
    }

    async fn update_stock(
        &self,
        product_id: &str,
        delta: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        self.with_product_lock(product_id, |tx| {
            let mut stock = tx.stock(product_id);
            let change = stock.apply_delta(delta)?;
            tx.record(change.into_movement(product_id, None, reason));
            tx.put_stock(stock.clone());
            Ok(stock)
        })
        .await
    }

    async fn adjust_stock(
        &self,
        product_id: &str,
        new_total: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        self.with_product_lock(product_id, |tx| {
            let mut stock = tx.stock(product_id);
            let change = stock.adjust_total(new_total)?;
            tx.record(change.into_movement(product_id, None, reason));
            tx.put_stock(stock.clone());
            Ok(stock)
        })
        .await
    }

    async fn create_reservation(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> InventoryResult<Reservation> {
        let warehouse_id = self.warehouse_id.clone();
        self.with_product_lock(product_id, |tx| {
            if tx
                .reservations_for(order_id)
                .iter()
                .any(|r| r.product_id == product_id && r.is_active())
            {
                return Err(InventoryError::DuplicateReservation {
                    order_id: order_id.to_string(),
                    product_id: product_id.to_string(),
                });
            }

            let mut stock = tx.stock(product_id);
            let change = stock.reserve(quantity)?;
            let reservation =
                Reservation::pending(order_id, product_id, &warehouse_id, quantity, expires_at);

            tx.put_stock(stock);
            tx.put_reservation(reservation.clone());
            tx.record(change.into_movement(
                product_id,
                Some((ORDER_REFERENCE, order_id)),
                &format!("reserved for order {order_id}"),
            ));
            Ok(reservation)
        })
        .await
    }

    async fn commit_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        let reason = format!("committed for order {order_id}");
        self.settle_order(order_id, None, Settlement::Commit, &reason)
            .await
    }

    async fn release_reservations(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        self.settle_order(order_id, product_id, Settlement::Release, reason)
            .await
    }

    async fn get_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        let state = self.state();
        let tx = MemoryTx::new(&state, &self.warehouse_id);
        Ok(tx.reservations_for(order_id))
    }

    async fn get_movements(
        &self,
        product_id: &str,
        limit: i64,
        offset: i64,
    ) -> InventoryResult<Vec<StockMovement>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let offset = usize::try_from(offset).unwrap_or(0);
        Ok(self
            .state()
            .movements
            .iter()
            .rev()
            .filter(|m| m.product_id == product_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn expire_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> InventoryResult<Vec<Reservation>> {
        let mut candidates: Vec<Reservation> = self
            .state()
            .reservations
            .iter()
            .filter(|r| r.is_pending() && r.expires_at <= now)
            .cloned()
            .collect();
        candidates.sort_by_key(|r| r.expires_at);
        candidates.truncate(usize::try_from(limit).unwrap_or(0));

        let mut expired = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let result = self
                .with_product_lock(&candidate.product_id, |tx| {
                    let current = tx
                        .reservations_for(&candidate.order_id)
                        .into_iter()
                        .find(|r| r.id == candidate.id);
                    let Some(mut reservation) = current.filter(|r| r.is_pending()) else {
                        return Ok(None);
                    };

                    let mut stock = tx.stock(&reservation.product_id);
                    let movement =
                        Settlement::Expire.apply(&mut stock, &mut reservation, EXPIRY_REASON)?;
                    tx.put_stock(stock);
                    tx.put_reservation(reservation.clone());
                    tx.record(movement);
                    Ok(Some(reservation))
                })
                .await;

            match result {
                Ok(reservation) => expired.extend(reservation),
                Err(e) => warn!("Failed to expire reservation {}: {}", candidate.id, e),
            }
        }
        Ok(expired)
    }

    async fn is_event_processed(&self, event_key: &str) -> InventoryResult<bool> {
        Ok(self.state().processed.contains_key(event_key))
    }

    async fn mark_event_processed(&self, event: ProcessedEvent) -> InventoryResult<()> {
        self.state()
            .processed
            .entry(event.event_key.clone())
            .or_insert(event);
        Ok(())
    }
}
