//! Counter arithmetic for a single stock row.
//!
//! Every operation either succeeds and leaves `available + reserved == total`
//! with all three counters non-negative, or fails without touching the row.
//! The returned [`StockChange`] is what gets written to `stock_movements` in
//! the same transaction as the row update.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{InventoryError, InventoryResult};
use crate::models::{MovementType, Reservation, ReservationStatus, Stock, StockMovement};

pub const ORDER_REFERENCE: &str = "order";

pub const EXPIRY_REASON: &str = "reservation expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    pub movement_type: MovementType,
    pub quantity: i32,
    pub before: i32,
    pub after: i32,
}

impl StockChange {
    pub fn into_movement(
        self,
        product_id: &str,
        reference: Option<(&str, &str)>,
        reason: &str,
    ) -> StockMovement {
        StockMovement {
            id: Uuid::new_v4(),
            product_id: product_id.to_string(),
            movement_type: self.movement_type.as_str().to_string(),
            quantity: self.quantity,
            before_quantity: self.before,
            after_quantity: self.after,
            reference_type: reference.map(|(kind, _)| kind.to_string()),
            reference_id: reference.map(|(_, id)| id.to_string()),
            reason: reason.to_string(),
            created_at: Utc::now(),
        }
    }
}

fn overflow(product_id: &str) -> InventoryError {
    InventoryError::Validation(format!("quantity overflow for product {product_id}"))
}

impl Stock {
    /// Receives (`delta > 0`) or ships (`delta < 0`) physical stock.
    pub fn apply_delta(&mut self, delta: i32) -> InventoryResult<StockChange> {
        if delta == 0 {
            return Err(InventoryError::Validation(
                "stock delta must not be zero".to_string(),
            ));
        }

        let total = self
            .total
            .checked_add(delta)
            .ok_or_else(|| overflow(&self.product_id))?;
        let available = total - self.reserved;
        if total < 0 || available < 0 {
            return Err(InventoryError::InsufficientStock {
                product_id: self.product_id.clone(),
                requested: delta.saturating_neg(),
                available: self.available,
            });
        }

        let change = StockChange {
            movement_type: if delta > 0 {
                MovementType::Inbound
            } else {
                MovementType::Outbound
            },
            quantity: delta,
            before: self.total,
            after: total,
        };
        self.total = total;
        self.available = available;
        self.touch();
        Ok(change)
    }

    /// Overwrites the physical count after a stock-take. Reserved units stay
    /// reserved, so the new total may not drop below them.
    pub fn adjust_total(&mut self, new_total: i32) -> InventoryResult<StockChange> {
        if new_total < 0 {
            return Err(InventoryError::Validation(format!(
                "adjusted total for product {} must not be negative",
                self.product_id
            )));
        }
        if new_total < self.reserved {
            return Err(InventoryError::InsufficientStock {
                product_id: self.product_id.clone(),
                requested: self.reserved,
                available: new_total,
            });
        }

        let change = StockChange {
            movement_type: MovementType::Adjustment,
            quantity: new_total - self.total,
            before: self.total,
            after: new_total,
        };
        self.total = new_total;
        self.available = new_total - self.reserved;
        self.touch();
        Ok(change)
    }

    pub fn reserve(&mut self, quantity: i32) -> InventoryResult<StockChange> {
        positive(quantity)?;
        if self.available < quantity {
            return Err(InventoryError::InsufficientStock {
                product_id: self.product_id.clone(),
                requested: quantity,
                available: self.available,
            });
        }
        let reserved = self
            .reserved
            .checked_add(quantity)
            .ok_or_else(|| overflow(&self.product_id))?;

        let change = StockChange {
            movement_type: MovementType::Reserved,
            quantity: -quantity,
            before: self.available,
            after: self.available - quantity,
        };
        self.available -= quantity;
        self.reserved = reserved;
        self.touch();
        Ok(change)
    }

    /// Returns reserved units to `available`.
    pub fn release(&mut self, quantity: i32) -> InventoryResult<StockChange> {
        positive(quantity)?;
        self.ensure_reserved(quantity)?;

        let change = StockChange {
            movement_type: MovementType::Released,
            quantity,
            before: self.available,
            after: self.available + quantity,
        };
        self.reserved -= quantity;
        self.available += quantity;
        self.touch();
        Ok(change)
    }

    /// Removes reserved units from inventory for good.
    pub fn commit(&mut self, quantity: i32) -> InventoryResult<StockChange> {
        positive(quantity)?;
        self.ensure_reserved(quantity)?;

        let change = StockChange {
            movement_type: MovementType::Committed,
            quantity: -quantity,
            before: self.total,
            after: self.total - quantity,
        };
        self.reserved -= quantity;
        self.total -= quantity;
        self.touch();
        Ok(change)
    }

    fn ensure_reserved(&self, quantity: i32) -> InventoryResult<()> {
        if self.reserved < quantity {
            return Err(InventoryError::Validation(format!(
                "product {} has {} units reserved, cannot settle {}",
                self.product_id, self.reserved, quantity
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn positive(quantity: i32) -> InventoryResult<()> {
    if quantity <= 0 {
        return Err(InventoryError::Validation(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    Ok(())
}

/// How a PENDING reservation leaves the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Commit,
    Release,
    Expire,
}

impl Settlement {
    pub fn status(&self) -> ReservationStatus {
        match self {
            Settlement::Commit => ReservationStatus::Committed,
            Settlement::Release => ReservationStatus::Released,
            Settlement::Expire => ReservationStatus::Expired,
        }
    }

    /// Applies the settlement to a locked stock row and its reservation and
    /// returns the movement to record.
    pub fn apply(
        &self,
        stock: &mut Stock,
        reservation: &mut Reservation,
        reason: &str,
    ) -> InventoryResult<StockMovement> {
        let change = match self {
            Settlement::Commit => stock.commit(reservation.quantity)?,
            Settlement::Release | Settlement::Expire => stock.release(reservation.quantity)?,
        };
        reservation.transition(self.status())?;

        Ok(change.into_movement(
            &stock.product_id,
            Some((ORDER_REFERENCE, reservation.order_id.as_str())),
            reason,
        ))
    }
}
