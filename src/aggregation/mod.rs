//! # Daily Transaction Aggregation
//!
//! Folds an ordered stream of transfer and gas events into daily and
//! lifetime aggregates per address, token and contract.
//!
//! ## Architecture
//!
//! ```text
//! LivePoller ──┐
//! Ticks ───────┼──▶ Dispatcher (bounded FIFO) ──▶ consumer thread: AggregationEngine
//! Resync ──────┘          ▲                                │ snapshots, acks
//!                         │                                ▼
//!                         └── StagingKeysEvicted ── snapshot writer task ──▶ SQLite
//! ```
//!
//! **Key Principle:** one thread owns every live aggregate. Producers only
//! enqueue events; persistence runs behind an unbounded sink so the consumer
//! never waits on disk.
//!
//! ## Epochs
//!
//! The epoch is the UTC date id (`yyyymmdd`) of the transactions being
//! aggregated. The first transaction of a later day sinks the whole epoch:
//! aggregates move to staging until their rows are durable, then return to
//! the baseline cache for the following days.
//!
//! ## Schema Reference
//!
//! All rows match the SQL schema in `/sql/`:
//! - `address_daily_aggregation` → `AddressRow`
//! - `token_daily_aggregation` → `TokenRow`
//! - `contract_daily_aggregation` → `ContractRow`
//! - `tx_detail` → `TransactionInfo`
//!
//! ## Module Organization
//!
//! - `types`, `keys`, `rows` - Core data structures
//! - `entity` - Aggregate state machines
//! - `engine` - Event handling on the consumer thread
//! - `dispatcher` - Event queue and consumer thread
//! - `baseline`, `staging` - Aggregate lifecycle between epochs
//! - `sink`, `db` - Persistence
//! - `source`, `resync` - Producers

pub mod baseline;
pub mod config;
pub mod context;
pub mod counter;
pub mod db;
pub mod decimal;
pub mod dispatcher;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod keys;
pub mod oracle;
pub mod registry;
pub mod resync;
pub mod rows;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod staging;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::AggregationConfig;
pub use dispatcher::{spawn_consumer, Dispatcher};
pub use engine::AggregationEngine;
pub use events::Event;
pub use keys::AggregateKey;
pub use types::TransactionInfo;
