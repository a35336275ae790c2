use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shared::OrderItem;
use tracing::{error, info, warn};

use crate::error::{InventoryError, InventoryResult};
use crate::metrics::InventoryMetrics;
use crate::models::{ProcessedEvent, Reservation, Stock, StockMovement};
use crate::repository::SharedRepository;
use crate::saga::ReservationSaga;

pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
pub const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How long a PENDING reservation holds stock before the sweeper may expire it.
    pub reservation_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(30),
        }
    }
}

/// Business operations over the stock ledger. This is what the RPC surface
/// (`GetStock`, `UpdateStock`, `ReserveStock`, `ReleaseStock`, `CommitStock`,
/// `CheckAvailability`, `GetStockHistory`) and the order-event subscriber
/// call into. Inputs are validated here, before any I/O.
pub struct ReservationEngine {
    repo: SharedRepository,
    metrics: Arc<InventoryMetrics>,
    config: EngineConfig,
}

fn require_id(field: &str, value: &str) -> InventoryResult<()> {
    if value.trim().is_empty() {
        return Err(InventoryError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn require_quantity(product_id: &str, quantity: i32) -> InventoryResult<()> {
    if quantity <= 0 {
        return Err(InventoryError::Validation(format!(
            "quantity for product {product_id} must be positive, got {quantity}"
        )));
    }
    Ok(())
}

fn reason_or<'a>(reason: &'a str, fallback: &'a str) -> &'a str {
    if reason.trim().is_empty() {
        fallback
    } else {
        reason
    }
}

impl ReservationEngine {
    pub fn new(repo: SharedRepository, metrics: Arc<InventoryMetrics>, config: EngineConfig) -> Self {
        Self {
            repo,
            metrics,
            config,
        }
    }

    pub async fn get_stock(&self, product_id: &str) -> InventoryResult<Stock> {
        require_id("product_id", product_id)?;
        self.repo
            .get_stock(product_id)
            .await
            .map_err(|e| e.context("get stock"))
    }

    pub async fn update_stock(
        &self,
        product_id: &str,
        delta: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        require_id("product_id", product_id)?;
        if delta == 0 {
            return Err(InventoryError::Validation(
                "stock delta must not be zero".to_string(),
            ));
        }

        let result = self
            .repo
            .update_stock(product_id, delta, reason_or(reason, "stock update"))
            .await;
        match result {
            Ok(stock) => {
                self.metrics.stock_updated();
                info!(
                    "Stock for product {} changed by {} (available {}, reserved {}, total {})",
                    product_id, delta, stock.available, stock.reserved, stock.total
                );
                Ok(stock)
            }
            Err(e) => {
                if matches!(e, InventoryError::InsufficientStock { .. }) {
                    self.metrics.insufficient_stock();
                }
                Err(e.context("update stock"))
            }
        }
    }

    pub async fn adjust_stock(
        &self,
        product_id: &str,
        new_total: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        require_id("product_id", product_id)?;
        if new_total < 0 {
            return Err(InventoryError::Validation(format!(
                "adjusted total must not be negative, got {new_total}"
            )));
        }

        let stock = self
            .repo
            .adjust_stock(product_id, new_total, reason_or(reason, "stock adjustment"))
            .await
            .map_err(|e| e.context("adjust stock"))?;
        self.metrics.stock_updated();
        info!("Stock for product {} adjusted to {}", product_id, new_total);
        Ok(stock)
    }

    pub async fn check_availability(&self, product_id: &str, quantity: i32) -> InventoryResult<bool> {
        require_id("product_id", product_id)?;
        require_quantity(product_id, quantity)?;
        self.repo
            .check_availability(product_id, quantity)
            .await
            .map_err(|e| e.context("check availability"))
    }

    pub async fn get_stock_history(
        &self,
        product_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> InventoryResult<Vec<StockMovement>> {
        require_id("product_id", product_id)?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let offset = offset.unwrap_or(0).max(0);

        self.repo
            .get_movements(product_id, limit, offset)
            .await
            .map_err(|e| e.context("get stock history"))
    }

    pub async fn get_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        require_id("order_id", order_id)?;
        self.repo
            .get_reservations(order_id)
            .await
            .map_err(|e| e.context("get reservations"))
    }

    /// Holds `quantity` units of one product for the order.
    pub async fn create_reservation(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> InventoryResult<Reservation> {
        require_id("order_id", order_id)?;
        require_id("product_id", product_id)?;
        require_quantity(product_id, quantity)?;

        let expires_at = Utc::now() + self.config.reservation_ttl;
        match self
            .repo
            .create_reservation(order_id, product_id, quantity, expires_at)
            .await
        {
            Ok(reservation) => {
                self.metrics.reservations_created(1);
                Ok(reservation)
            }
            Err(e) => {
                if matches!(e, InventoryError::InsufficientStock { .. }) {
                    self.metrics.insufficient_stock();
                }
                Err(e.context("create reservation"))
            }
        }
    }

    /// Reserves every line of an order or none of them.
    ///
    /// All lines are checked first and the call fails before holding anything
    /// if one is short. Lines are then reserved one by one; if a later line
    /// loses a race for its stock, the lines already held are released again.
    ///
    /// Only PENDING and COMMITTED rows count as held. An order that holds every
    /// line is returned as-is, so a redelivered order event cannot reserve
    /// twice. An order holding some lines (an earlier attempt whose
    /// compensation failed) keeps them and reserves the rest; released or
    /// expired rows from earlier attempts are history and do not block a retry.
    pub async fn reserve_stock(
        &self,
        order_id: &str,
        items: &[OrderItem],
    ) -> InventoryResult<Vec<Reservation>> {
        require_id("order_id", order_id)?;
        if items.is_empty() {
            return Err(InventoryError::Validation(format!(
                "order {order_id} has no items to reserve"
            )));
        }
        for item in items {
            require_id("product_id", &item.product_id)?;
            require_quantity(&item.product_id, item.quantity)?;
        }

        let mut saga = ReservationSaga::new(order_id, items)?;

        let held: Vec<Reservation> = self
            .get_reservations(order_id)
            .await?
            .into_iter()
            .filter(Reservation::is_active)
            .collect();
        if !held.is_empty() {
            let complete = saga
                .steps
                .iter()
                .all(|step| held.iter().any(|r| r.product_id == step.product_id));
            if complete {
                info!(
                    "Order {} already holds {} reservation(s), skipping",
                    order_id,
                    held.len()
                );
                return Ok(held);
            }
            info!(
                "Order {} resumes with {} line(s) already held",
                order_id,
                held.len()
            );
            saga.adopt(held);
        }

        let steps = saga.steps.clone();
        for step in &steps {
            let available = self
                .repo
                .check_availability(&step.product_id, step.quantity)
                .await
                .map_err(|e| e.context("check availability"))?;
            if !available {
                let on_hand = self
                    .repo
                    .get_stock(&step.product_id)
                    .await
                    .map(|s| s.available)
                    .unwrap_or(0);
                let err = InventoryError::InsufficientStock {
                    product_id: step.product_id.clone(),
                    requested: step.quantity,
                    available: on_hand,
                };
                self.metrics.insufficient_stock();
                info!("Order {} rejected: {}", order_id, err);
                if saga.compensation_steps().is_empty() {
                    saga.reject(err.to_string());
                    return Err(err);
                }
                saga.fail_step(err.to_string());
                return Err(self.compensate(&mut saga, err).await);
            }
        }

        let created = steps.len();
        saga.begin_reserving();
        while let Some(step) = saga.next_step().cloned() {
            let expires_at = Utc::now() + self.config.reservation_ttl;
            match self
                .repo
                .create_reservation(order_id, &step.product_id, step.quantity, expires_at)
                .await
            {
                Ok(reservation) => saga.advance_step(reservation),
                Err(e) => {
                    if matches!(e, InventoryError::InsufficientStock { .. }) {
                        self.metrics.insufficient_stock();
                    }
                    warn!(
                        "Reservation of {} x {} for order {} failed, compensating: {}",
                        step.quantity, step.product_id, order_id, e
                    );
                    saga.fail_step(e.to_string());
                    return Err(self.compensate(&mut saga, e).await);
                }
            }
        }

        let reservations = saga.into_reservations();
        self.metrics.reservations_created(created);
        info!(
            "Reserved {} line(s) for order {}",
            reservations.len(),
            order_id
        );
        Ok(reservations)
    }

    /// Releases the saga's completed steps newest-first. Returns `cause` when
    /// every release worked, otherwise a retryable `CompensationFailed`.
    async fn compensate(&self, saga: &mut ReservationSaga, cause: InventoryError) -> InventoryError {
        let products: Vec<String> = saga
            .compensation_steps()
            .iter()
            .map(|r| r.product_id.clone())
            .collect();

        let mut failures = Vec::new();
        for product_id in &products {
            let released = self
                .repo
                .release_reservations(&saga.order_id, Some(product_id.as_str()), "saga compensation")
                .await;
            match released {
                Ok(rows) => self.metrics.reservations_released(rows.len()),
                Err(InventoryError::NotFound(_)) => {}
                Err(e) => failures.push(format!("release of {product_id} failed: {e}")),
            }
        }

        if failures.is_empty() {
            saga.compensated();
            self.metrics.saga_compensated();
            info!(
                "Compensated {} reservation(s) for order {}",
                products.len(),
                saga.order_id
            );
            return cause;
        }

        saga.compensation_failed(failures.join("; "));
        let message = saga.failure.clone().unwrap_or_default();
        error!("Compensation for order {} incomplete: {}", saga.order_id, message);
        InventoryError::CompensationFailed {
            order_id: saga.order_id.clone(),
            message,
        }
    }

    /// Consumes the order's held stock for good.
    pub async fn commit_reservation(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        require_id("order_id", order_id)?;
        let committed = self
            .repo
            .commit_reservations(order_id)
            .await
            .map_err(|e| e.context("commit reservation"))?;
        self.metrics.reservations_committed(committed.len());
        info!("Committed {} reservation(s) for order {}", committed.len(), order_id);
        Ok(committed)
    }

    pub async fn commit_stock(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        self.commit_reservation(order_id).await
    }

    pub async fn release_reservation(
        &self,
        order_id: &str,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        self.release_stock(order_id, None, reason).await
    }

    /// Releases the order's held stock, or a single product line of it.
    pub async fn release_stock(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        require_id("order_id", order_id)?;
        if let Some(product_id) = product_id {
            require_id("product_id", product_id)?;
        }

        let released = self
            .repo
            .release_reservations(order_id, product_id, reason_or(reason, "released"))
            .await
            .map_err(|e| e.context("release reservation"))?;
        self.metrics.reservations_released(released.len());
        info!("Released {} reservation(s) for order {}", released.len(), order_id);
        Ok(released)
    }

    /// Expires overdue PENDING reservations in batches until a batch comes
    /// back short. Returns how many were expired.
    pub async fn expire_stale_reservations(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> InventoryResult<usize> {
        let batch_size = batch_size.max(1);
        let mut expired_total = 0;
        loop {
            let expired = self
                .repo
                .expire_reservations(now, batch_size)
                .await
                .map_err(|e| e.context("expire reservations"))?;
            for reservation in &expired {
                info!(
                    "Expired reservation of {} x {} for order {}",
                    reservation.quantity, reservation.product_id, reservation.order_id
                );
            }
            expired_total += expired.len();
            self.metrics.reservations_expired(expired.len());

            if (expired.len() as i64) < batch_size {
                return Ok(expired_total);
            }
        }
    }

    pub async fn is_event_processed(&self, event_key: &str) -> InventoryResult<bool> {
        self.repo.is_event_processed(event_key).await
    }

    pub async fn mark_event_processed(
        &self,
        event_key: String,
        order_id: &str,
        event_type: &str,
    ) -> InventoryResult<()> {
        self.repo
            .mark_event_processed(ProcessedEvent::new(event_key, order_id, event_type))
            .await
    }
}
