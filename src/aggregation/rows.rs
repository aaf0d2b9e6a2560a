//! Persistable aggregation rows
//!
//! One row per (entity kind, key, date id). Daily rows use the epoch date id,
//! lifetime rows the configured total date id, and shadow (`for_oep`) rows
//! the fixed `OEP_AGGREGATION_DATE_ID`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Date id of lifetime rows belonging to `for_oep` shadow keys
pub const OEP_AGGREGATION_DATE_ID: i32 = i32::MIN;

/// `address_daily_aggregation` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRow {
    pub address: String,
    pub token_contract_hash: String,
    pub date_id: i32,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub usd_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_balance: Decimal,
    pub deposit_tx_count: i64,
    pub withdraw_tx_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub deposit_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub withdraw_amount: Decimal,
    pub deposit_address_count: i64,
    pub withdraw_address_count: i64,
    pub tx_address_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub fee_amount: Decimal,
    pub contract_count: i64,
    pub is_virtual: bool,
    #[serde(with = "rust_decimal::serde::str")]
    pub previous_balance: Decimal,
}

/// `token_daily_aggregation` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRow {
    pub token_contract_hash: String,
    pub date_id: i32,
    #[serde(with = "rust_decimal::serde::str")]
    pub usd_price: Decimal,
    pub tx_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub tx_amount: Decimal,
    pub deposit_address_count: i64,
    pub withdraw_address_count: i64,
    pub tx_address_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub fee_amount: Decimal,
}

/// `contract_daily_aggregation` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRow {
    pub contract_hash: String,
    pub token_contract_hash: String,
    pub date_id: i32,
    #[serde(with = "rust_decimal::serde::str")]
    pub usd_price: Decimal,
    pub tx_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub tx_amount: Decimal,
    pub deposit_address_count: i64,
    pub withdraw_address_count: i64,
    pub tx_address_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub fee_amount: Decimal,
}

/// Any persisted row, tagged by entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateRow {
    Address(AddressRow),
    Token(TokenRow),
    Contract(ContractRow),
}

impl AggregateRow {
    pub fn date_id(&self) -> i32 {
        match self {
            AggregateRow::Address(row) => row.date_id,
            AggregateRow::Token(row) => row.date_id,
            AggregateRow::Contract(row) => row.date_id,
        }
    }
}
