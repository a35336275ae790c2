//! Stock ledger and reservation engine for the inventory service.
//!
//! Stock counters, reservations and the movement log live behind
//! [`repository::StockRepository`], with PostgreSQL and in-memory backends
//! sharing the arithmetic in [`ledger`]. [`cached::CachedStockRepository`]
//! puts a read-through cache in front, [`engine::ReservationEngine`] holds
//! the business operations, and order events reach it through
//! [`subscriber::OrderEventSubscriber`].

pub mod cache;
pub mod cached;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod saga;
pub mod schema;
pub mod subscriber;
pub mod sweeper;

#[cfg(test)]
mod testing;
