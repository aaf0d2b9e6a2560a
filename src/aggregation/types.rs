//! Core value types flowing through the aggregation engine
//!
//! `TransactionInfo` is built once per source row (one transfer or gas event
//! of an on-chain transaction) and never mutated afterwards.

use chrono::{DateTime, Datelike};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Virtual token bucket aggregating every token
pub const VIRTUAL_CONTRACT_ALL: &str = "$$ALL$$";

/// Virtual token bucket aggregating native contracts (ONT, ONG)
pub const VIRTUAL_CONTRACT_NATIVE: &str = "$$NATIVE$$";

/// Virtual token bucket aggregating OEP-4 tokens
pub const VIRTUAL_CONTRACT_OEP4: &str = "$$OEP4$$";

/// Virtual token bucket aggregating ORC-20 tokens
pub const VIRTUAL_CONTRACT_ORC20: &str = "$$ORC20$$";

pub const VIRTUAL_CONTRACTS: [&str; 4] = [
    VIRTUAL_CONTRACT_ALL,
    VIRTUAL_CONTRACT_NATIVE,
    VIRTUAL_CONTRACT_OEP4,
    VIRTUAL_CONTRACT_ORC20,
];

/// Returns true if the hash names one of the synthetic buckets
pub fn is_virtual_contract(hash: &str) -> bool {
    VIRTUAL_CONTRACTS.contains(&hash)
}

/// Kind of source event a transaction row was derived from
///
/// Numeric codes match the `event_type` column of the source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Gas,
    Transfer,
}

impl EventKind {
    pub fn code(&self) -> i64 {
        match self {
            EventKind::Gas => 2,
            EventKind::Transfer => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2 => Some(EventKind::Gas),
            3 => Some(EventKind::Transfer),
            _ => None,
        }
    }
}

/// One transfer or gas event, in source order
///
/// Ordering key is `(block_height, block_index, tx_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub tx_hash: String,
    pub block_height: i64,
    pub block_index: i64,
    pub tx_index: i64,
    pub timestamp: i64,
    pub date_id: i32,
    pub event_kind: EventKind,
    pub from_address: String,
    pub to_address: String,
    /// Token contract the value moved on
    pub contract_hash: String,
    /// Contract actually invoked by the transaction
    pub called_contract_hash: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub is_self_transaction: bool,
}

impl TransactionInfo {
    /// Build a transaction, deriving `date_id` and the self-transaction flag
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx_hash: impl Into<String>,
        block_height: i64,
        block_index: i64,
        tx_index: i64,
        timestamp: i64,
        event_kind: EventKind,
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        contract_hash: impl Into<String>,
        called_contract_hash: impl Into<String>,
        amount: Decimal,
        fee: Decimal,
    ) -> Self {
        let from_address = from_address.into();
        let to_address = to_address.into();
        let is_self_transaction = from_address == to_address;
        Self {
            tx_hash: tx_hash.into(),
            block_height,
            block_index,
            tx_index,
            timestamp,
            date_id: date_id_from_timestamp(timestamp),
            event_kind,
            from_address,
            to_address,
            contract_hash: contract_hash.into(),
            called_contract_hash: called_contract_hash.into(),
            amount,
            fee,
            is_self_transaction,
        }
    }
}

/// Convert a Unix timestamp (seconds) into a `yyyymmdd` UTC date id
///
/// Out-of-range timestamps map to 0, which every real epoch exceeds.
pub fn date_id_from_timestamp(timestamp: i64) -> i32 {
    match DateTime::from_timestamp(timestamp, 0) {
        Some(dt) => {
            let date = dt.date_naive();
            date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
        }
        None => 0,
    }
}

/// Date id of the current wall-clock day
pub fn current_date_id() -> i32 {
    date_id_from_timestamp(chrono::Utc::now().timestamp())
}

/// Render a date id as `yyyy-mm-dd` for logging
pub fn format_date_id(date_id: i32) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date_id / 10_000,
        (date_id / 100) % 100,
        date_id % 100
    )
}
