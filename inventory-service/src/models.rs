use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{InventoryError, InventoryResult};

pub const DEFAULT_WAREHOUSE: &str = "default";

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stocks)]
pub struct Stock {
    pub id: Uuid,
    pub product_id: String,
    pub warehouse_id: String,
    pub available: i32,
    pub reserved: i32,
    pub total: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stock {
    /// A zeroed row, as created on first access to a product.
    pub fn empty(product_id: &str, warehouse_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            product_id: product_id.to_string(),
            warehouse_id: warehouse_id.to_string(),
            available: 0,
            reserved: 0,
            total: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.available >= 0
            && self.reserved >= 0
            && self.total >= 0
            && self.available + self.reserved == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Committed => "COMMITTED",
            ReservationStatus::Released => "RELEASED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ReservationStatus::Pending),
            "COMMITTED" => Ok(ReservationStatus::Committed),
            "RELEASED" => Ok(ReservationStatus::Released),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            other => Err(InventoryError::Validation(format!(
                "unknown reservation status {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: String,
    pub product_id: String,
    pub warehouse_id: String,
    pub quantity: i32,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn pending(
        order_id: &str,
        product_id: &str,
        warehouse_id: &str,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            product_id: product_id.to_string(),
            warehouse_id: warehouse_id.to_string(),
            quantity,
            status: ReservationStatus::Pending.as_str().to_string(),
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> InventoryResult<ReservationStatus> {
        self.status.parse()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReservationStatus::Pending.as_str()
    }

    /// PENDING or COMMITTED: the row still holds or has consumed stock.
    pub fn is_active(&self) -> bool {
        self.is_pending() || self.status == ReservationStatus::Committed.as_str()
    }

    /// Moves a PENDING reservation into one of its terminal states.
    pub fn transition(&mut self, to: ReservationStatus) -> InventoryResult<()> {
        let from = self.status()?;
        if from.is_terminal() || to == ReservationStatus::Pending {
            return Err(InventoryError::InvalidTransition {
                reservation_id: self.id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to.as_str().to_string();
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Inbound,
    Outbound,
    Reserved,
    Released,
    Committed,
    Adjustment,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Inbound => "INBOUND",
            MovementType::Outbound => "OUTBOUND",
            MovementType::Reserved => "RESERVED",
            MovementType::Released => "RELEASED",
            MovementType::Committed => "COMMITTED",
            MovementType::Adjustment => "ADJUSTMENT",
        }
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry. `seq` is assigned by the database on insert and is not
/// part of this row; history selects these columns and orders by `seq`.
#[derive(
    Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Insertable, Serialize, Deserialize,
)]
#[diesel(table_name = crate::schema::stock_movements)]
pub struct StockMovement {
    pub id: Uuid,
    pub product_id: String,
    pub movement_type: String,
    pub quantity: i32,
    pub before_quantity: i32,
    pub after_quantity: i32,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_events)]
pub struct ProcessedEvent {
    pub event_key: String,
    pub order_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedEvent {
    pub fn new(event_key: String, order_id: &str, event_type: &str) -> Self {
        Self {
            event_key,
            order_id: order_id.to_string(),
            event_type: event_type.to_string(),
            processed_at: Utc::now(),
        }
    }
}
