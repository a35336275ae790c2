use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{InventoryError, InventoryResult};
use crate::ledger::{Settlement, EXPIRY_REASON, ORDER_REFERENCE};
use crate::models::*;
use crate::repository::StockRepository;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

/// PostgreSQL ledger. Product locks are `SELECT ... FOR UPDATE` on the
/// product's `stocks` row, held until the surrounding transaction ends.
#[derive(Clone)]
pub struct PgStockRepository {
    pool: DbPool,
    warehouse_id: String,
}

impl PgStockRepository {
    pub fn new(pool: DbPool) -> Self {
        Self::with_warehouse(pool, DEFAULT_WAREHOUSE)
    }

    pub fn with_warehouse(pool: DbPool, warehouse_id: impl Into<String>) -> Self {
        Self {
            pool,
            warehouse_id: warehouse_id.into(),
        }
    }

    async fn conn(&self) -> InventoryResult<PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| InventoryError::transaction("acquire connection", e))
    }

    async fn settle_order(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        settlement: Settlement,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        let order_id = order_id.to_string();
        let product_id = product_id.map(str::to_string);
        let reason = reason.to_string();

        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move {
                // Rows come back ordered by product id, so stock locks below are
                // taken in a stable order.
                let pending = reservations::table
                    .filter(reservations::order_id.eq(&order_id))
                    .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
                    .order(reservations::product_id.asc())
                    .for_update()
                    .load::<Reservation>(conn)
                    .await?;

                let pending: Vec<Reservation> = pending
                    .into_iter()
                    .filter(|r| product_id.as_deref().map_or(true, |p| r.product_id == p))
                    .collect();

                if pending.is_empty() {
                    return Err(InventoryError::NotFound(format!(
                        "pending reservation for order {order_id}"
                    )));
                }

                let mut settled = Vec::with_capacity(pending.len());
                for mut reservation in pending {
                    let mut stock =
                        lock_stock(conn, &reservation.product_id, &reservation.warehouse_id)
                            .await?;
                    let movement = settlement.apply(&mut stock, &mut reservation, &reason)?;
                    save_stock(conn, &stock).await?;
                    save_reservation_status(conn, &reservation).await?;
                    insert_movement(conn, &movement).await?;
                    settled.push(reservation);
                }

                Ok(settled)
            })
        })
        .await
    }
}

async fn ensure_stock(
    conn: &mut AsyncPgConnection,
    product_id: &str,
    warehouse_id: &str,
) -> InventoryResult<()> {
    diesel::insert_into(stocks::table)
        .values(&Stock::empty(product_id, warehouse_id))
        .on_conflict(stocks::product_id)
        .do_nothing()
        .execute(conn)
        .await?;
    Ok(())
}

async fn lock_stock(
    conn: &mut AsyncPgConnection,
    product_id: &str,
    warehouse_id: &str,
) -> InventoryResult<Stock> {
    ensure_stock(conn, product_id, warehouse_id).await?;

    let stock = stocks::table
        .filter(stocks::product_id.eq(product_id))
        .for_update()
        .first::<Stock>(conn)
        .await?;
    Ok(stock)
}

async fn save_stock(conn: &mut AsyncPgConnection, stock: &Stock) -> InventoryResult<()> {
    diesel::update(stocks::table.find(stock.id))
        .set((
            stocks::available.eq(stock.available),
            stocks::reserved.eq(stock.reserved),
            stocks::total.eq(stock.total),
            stocks::updated_at.eq(stock.updated_at),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

async fn save_reservation_status(
    conn: &mut AsyncPgConnection,
    reservation: &Reservation,
) -> InventoryResult<()> {
    diesel::update(reservations::table.find(reservation.id))
        .set((
            reservations::status.eq(&reservation.status),
            reservations::updated_at.eq(reservation.updated_at),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

async fn insert_movement(
    conn: &mut AsyncPgConnection,
    movement: &StockMovement,
) -> InventoryResult<()> {
    diesel::insert_into(stock_movements::table)
        .values(movement)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl StockRepository for PgStockRepository {
    async fn get_stock(&self, product_id: &str) -> InventoryResult<Stock> {
        let mut conn = self.conn().await?;

        let existing = stocks::table
            .filter(stocks::product_id.eq(product_id))
            .first::<Stock>(&mut conn)
            .await
            .optional()?;
        if let Some(stock) = existing {
            return Ok(stock);
        }

        ensure_stock(&mut conn, product_id, &self.warehouse_id).await?;
        let stock = stocks::table
            .filter(stocks::product_id.eq(product_id))
            .first::<Stock>(&mut conn)
            .await?;
        debug!("Created stock row for product {}", product_id);
        Ok(stock)
    }

    async fn update_stock(
        &self,
        product_id: &str,
        delta: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        let product_id = product_id.to_string();
        let reason = reason.to_string();
        let warehouse_id = self.warehouse_id.clone();

        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move {
                let mut stock = lock_stock(conn, &product_id, &warehouse_id).await?;
                let change = stock.apply_delta(delta)?;
                save_stock(conn, &stock).await?;
                insert_movement(conn, &change.into_movement(&product_id, None, &reason)).await?;
                Ok(stock)
            })
        })
        .await
        .map_err(|e| e.context("update_stock"))
    }

    async fn adjust_stock(
        &self,
        product_id: &str,
        new_total: i32,
        reason: &str,
    ) -> InventoryResult<Stock> {
        let product_id = product_id.to_string();
        let reason = reason.to_string();
        let warehouse_id = self.warehouse_id.clone();

        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move {
                let mut stock = lock_stock(conn, &product_id, &warehouse_id).await?;
                let change = stock.adjust_total(new_total)?;
                save_stock(conn, &stock).await?;
                insert_movement(conn, &change.into_movement(&product_id, None, &reason)).await?;
                Ok(stock)
            })
        })
        .await
        .map_err(|e| e.context("adjust_stock"))
    }

    async fn create_reservation(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> InventoryResult<Reservation> {
        let order_id = order_id.to_string();
        let product_id = product_id.to_string();
        let warehouse_id = self.warehouse_id.clone();

        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        conn.transaction::<_, InventoryError, _>(|conn| {
            Box::pin(async move {
                let mut stock = lock_stock(conn, &product_id, &warehouse_id).await?;

                let existing = reservations::table
                    .filter(reservations::order_id.eq(&order_id))
                    .filter(reservations::product_id.eq(&product_id))
                    .filter(reservations::status.eq_any(vec![
                        ReservationStatus::Pending.as_str(),
                        ReservationStatus::Committed.as_str(),
                    ]))
                    .select(reservations::id)
                    .first::<Uuid>(conn)
                    .await
                    .optional()?;
                if existing.is_some() {
                    return Err(InventoryError::DuplicateReservation {
                        order_id: order_id.clone(),
                        product_id: product_id.clone(),
                    });
                }

                let change = stock.reserve(quantity)?;
                let reservation =
                    Reservation::pending(&order_id, &product_id, &warehouse_id, quantity, expires_at);

                save_stock(conn, &stock).await?;
                diesel::insert_into(reservations::table)
                    .values(&reservation)
                    .execute(conn)
                    .await?;
                let movement = change.into_movement(
                    &product_id,
                    Some((ORDER_REFERENCE, order_id.as_str())),
                    &format!("reserved for order {order_id}"),
                );
                insert_movement(conn, &movement).await?;

                Ok(reservation)
            })
        })
        .await
        .map_err(|e| e.context("create_reservation"))
    }

    async fn commit_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        let reason = format!("committed for order {order_id}");
        self.settle_order(order_id, None, Settlement::Commit, &reason)
            .await
            .map_err(|e| e.context("commit_reservations"))
    }

    async fn release_reservations(
        &self,
        order_id: &str,
        product_id: Option<&str>,
        reason: &str,
    ) -> InventoryResult<Vec<Reservation>> {
        self.settle_order(order_id, product_id, Settlement::Release, reason)
            .await
            .map_err(|e| e.context("release_reservations"))
    }

    async fn get_reservations(&self, order_id: &str) -> InventoryResult<Vec<Reservation>> {
        let mut conn = self.conn().await?;
        let rows = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .order(reservations::product_id.asc())
            .load::<Reservation>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn get_movements(
        &self,
        product_id: &str,
        limit: i64,
        offset: i64,
    ) -> InventoryResult<Vec<StockMovement>> {
        let mut conn = self.conn().await?;
        let rows = stock_movements::table
            .filter(stock_movements::product_id.eq(product_id))
            .order(stock_movements::seq.desc())
            .limit(limit)
            .offset(offset)
            .select(StockMovement::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn expire_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> InventoryResult<Vec<Reservation>> {
        let mut conn = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut conn;

        let candidates = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
            .filter(reservations::expires_at.le(now))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .select(reservations::id)
            .load::<Uuid>(conn)
            .await?;

        let mut expired = Vec::with_capacity(candidates.len());
        for id in candidates {
            let result = conn
                .transaction::<_, InventoryError, _>(|conn| {
                    Box::pin(async move {
                        let reservation = reservations::table
                            .find(id)
                            .for_update()
                            .first::<Reservation>(conn)
                            .await
                            .optional()?;
                        let Some(mut reservation) =
                            reservation.filter(|r| r.is_pending() && r.expires_at <= now)
                        else {
                            return Ok(None);
                        };

                        let mut stock =
                            lock_stock(conn, &reservation.product_id, &reservation.warehouse_id)
                                .await?;
                        let movement =
                            Settlement::Expire.apply(&mut stock, &mut reservation, EXPIRY_REASON)?;
                        save_stock(conn, &stock).await?;
                        save_reservation_status(conn, &reservation).await?;
                        insert_movement(conn, &movement).await?;
                        Ok(Some(reservation))
                    })
                })
                .await;

            match result {
                Ok(Some(reservation)) => expired.push(reservation),
                Ok(None) => {}
                Err(e) => warn!("Failed to expire reservation {}: {}", id, e),
            }
        }

        Ok(expired)
    }

    async fn is_event_processed(&self, event_key: &str) -> InventoryResult<bool> {
        let mut conn = self.conn().await?;
        let found = processed_events::table
            .find(event_key)
            .select(processed_events::event_key)
            .first::<String>(&mut conn)
            .await
            .optional()?;
        Ok(found.is_some())
    }

    async fn mark_event_processed(&self, event: ProcessedEvent) -> InventoryResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(processed_events::table)
            .values(&event)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
