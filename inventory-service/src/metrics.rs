//! Counters for the stock ledger.
//!
//! One [`InventoryMetrics`] is created at start-up and handed to every
//! component that reports, so tests can build their own and assert on it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct InventoryMetrics {
    stock_updates: AtomicU64,
    reservations_created: AtomicU64,
    reservations_committed: AtomicU64,
    reservations_released: AtomicU64,
    reservations_expired: AtomicU64,
    insufficient_stock: AtomicU64,
    saga_compensations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
    events_acked: AtomicU64,
    events_requeued: AtomicU64,
    events_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub stock_updates: u64,
    pub reservations_created: u64,
    pub reservations_committed: u64,
    pub reservations_released: u64,
    pub reservations_expired: u64,
    pub insufficient_stock: u64,
    pub saga_compensations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub events_acked: u64,
    pub events_requeued: u64,
    pub events_dropped: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl InventoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stock_updated(&self) {
        bump(&self.stock_updates, 1);
    }

    pub fn reservations_created(&self, count: usize) {
        bump(&self.reservations_created, count as u64);
    }

    pub fn reservations_committed(&self, count: usize) {
        bump(&self.reservations_committed, count as u64);
    }

    pub fn reservations_released(&self, count: usize) {
        bump(&self.reservations_released, count as u64);
    }

    pub fn reservations_expired(&self, count: usize) {
        bump(&self.reservations_expired, count as u64);
    }

    pub fn insufficient_stock(&self) {
        bump(&self.insufficient_stock, 1);
    }

    pub fn saga_compensated(&self) {
        bump(&self.saga_compensations, 1);
    }

    pub fn cache_hit(&self) {
        bump(&self.cache_hits, 1);
    }

    pub fn cache_miss(&self) {
        bump(&self.cache_misses, 1);
    }

    pub fn cache_error(&self) {
        bump(&self.cache_errors, 1);
    }

    pub fn event_acked(&self) {
        bump(&self.events_acked, 1);
    }

    pub fn event_requeued(&self) {
        bump(&self.events_requeued, 1);
    }

    pub fn event_dropped(&self) {
        bump(&self.events_dropped, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            stock_updates: read(&self.stock_updates),
            reservations_created: read(&self.reservations_created),
            reservations_committed: read(&self.reservations_committed),
            reservations_released: read(&self.reservations_released),
            reservations_expired: read(&self.reservations_expired),
            insufficient_stock: read(&self.insufficient_stock),
            saga_compensations: read(&self.saga_compensations),
            cache_hits: read(&self.cache_hits),
            cache_misses: read(&self.cache_misses),
            cache_errors: read(&self.cache_errors),
            events_acked: read(&self.events_acked),
            events_requeued: read(&self.events_requeued),
            events_dropped: read(&self.events_dropped),
        }
    }
}
