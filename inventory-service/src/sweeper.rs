use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time;
use tracing::{debug, error, info};

use crate::engine::ReservationEngine;
use crate::error::InventoryResult;
use crate::metrics::InventoryMetrics;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_BATCH: i64 = 100;

/// Periodically returns the stock of overdue PENDING reservations.
pub struct ExpirySweeper {
    engine: Arc<ReservationEngine>,
    metrics: Arc<InventoryMetrics>,
    interval: Duration,
    batch_size: i64,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<ReservationEngine>, metrics: Arc<InventoryMetrics>) -> Self {
        Self {
            engine,
            metrics,
            interval: DEFAULT_SWEEP_INTERVAL,
            batch_size: DEFAULT_SWEEP_BATCH,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.sweep().await {
                error!("Error expiring reservations: {}", e);
            }
            debug!(metrics = ?self.metrics.snapshot(), "Inventory metrics");
        }
    }

    pub async fn sweep(&self) -> InventoryResult<usize> {
        let expired = self
            .engine
            .expire_stale_reservations(Utc::now(), self.batch_size)
            .await?;
        if expired > 0 {
            info!("Expired {} stale reservation(s)", expired);
        }
        Ok(expired)
    }
}
