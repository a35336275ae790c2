use shared::OrderItem;

use crate::error::{InventoryError, InventoryResult};
use crate::models::Reservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    /// Availability of every line is being checked; nothing is held yet.
    Checking,
    Reserving,
    Completed,
    /// A line was short during the check; nothing was reserved.
    Rejected,
    Compensating,
    Compensated,
    CompensationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationStep {
    pub product_id: String,
    pub quantity: i32,
}

/// Multi-line reservation of one order.
///
/// Lines are reserved one at a time; each successful reservation is appended
/// to the rollback log. When a line fails after others succeeded, the log is
/// replayed newest-first to release what was taken.
#[derive(Debug, Clone)]
pub struct ReservationSaga {
    pub order_id: String,
    pub steps: Vec<ReservationStep>,
    pub current_step: usize,
    pub status: SagaStatus,
    pub failure: Option<String>,
    rollback_log: Vec<Reservation>,
}

impl ReservationSaga {
    /// Builds the saga, folding repeated products into one step.
    pub fn new(order_id: &str, items: &[OrderItem]) -> InventoryResult<Self> {
        let mut steps: Vec<ReservationStep> = Vec::with_capacity(items.len());
        for item in items {
            match steps.iter_mut().find(|s| s.product_id == item.product_id) {
                Some(step) => {
                    step.quantity = step.quantity.checked_add(item.quantity).ok_or_else(|| {
                        InventoryError::Validation(format!(
                            "quantity overflow for product {}",
                            item.product_id
                        ))
                    })?;
                }
                None => steps.push(ReservationStep {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                }),
            }
        }

        Ok(Self {
            order_id: order_id.to_string(),
            steps,
            current_step: 0,
            status: SagaStatus::Checking,
            failure: None,
            rollback_log: Vec::new(),
        })
    }

    /// Takes over lines an earlier attempt still holds. Their steps are
    /// dropped and the rows join the rollback log.
    pub fn adopt(&mut self, held: Vec<Reservation>) {
        for reservation in held {
            self.steps.retain(|s| s.product_id != reservation.product_id);
            self.rollback_log.push(reservation);
        }
    }

    pub fn begin_reserving(&mut self) {
        self.status = SagaStatus::Reserving;
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        self.status = SagaStatus::Rejected;
        self.failure = Some(reason.into());
    }

    pub fn next_step(&self) -> Option<&ReservationStep> {
        if self.status != SagaStatus::Reserving {
            return None;
        }
        self.steps.get(self.current_step)
    }

    pub fn advance_step(&mut self, reservation: Reservation) {
        self.rollback_log.push(reservation);
        self.current_step += 1;
        if self.current_step >= self.steps.len() {
            self.status = SagaStatus::Completed;
        }
    }

    pub fn fail_step(&mut self, reason: impl Into<String>) {
        self.status = SagaStatus::Compensating;
        self.failure = Some(reason.into());
    }

    /// Reservations to release, newest first.
    pub fn compensation_steps(&self) -> Vec<&Reservation> {
        self.rollback_log.iter().rev().collect()
    }

    pub fn compensated(&mut self) {
        self.status = SagaStatus::Compensated;
    }

    pub fn compensation_failed(&mut self, reason: impl Into<String>) {
        self.status = SagaStatus::CompensationFailed;
        let reason = reason.into();
        self.failure = Some(match self.failure.take() {
            Some(original) => format!("{original}; {reason}"),
            None => reason,
        });
    }

    pub fn into_reservations(self) -> Vec<Reservation> {
        self.rollback_log
    }
}
