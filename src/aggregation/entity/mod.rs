//! Live aggregate state machines, one variant per key kind

pub mod address;
pub mod flow;

pub use address::AddressAggregate;
pub use flow::{ContractAggregate, TokenAggregate};

use super::context::AggregationRules;
use super::keys::AggregateKey;
use super::oracle::BalanceOracle;
use super::rows::AggregateRow;
use super::types::TransactionInfo;

/// One live aggregate per key per epoch
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    Address(AddressAggregate),
    Token(TokenAggregate),
    Contract(ContractAggregate),
}

impl Aggregate {
    pub fn key(&self) -> AggregateKey {
        match self {
            Aggregate::Address(a) => a.key(),
            Aggregate::Token(a) => a.key(),
            Aggregate::Contract(a) => a.key(),
        }
    }

    pub fn is_changed(&self) -> bool {
        match self {
            Aggregate::Address(a) => a.is_changed(),
            Aggregate::Token(a) => a.is_changed(),
            Aggregate::Contract(a) => a.is_changed(),
        }
    }

    /// Reset per-epoch deltas, keeping balance and lifetime state
    pub fn rebase(&mut self, resyncing: bool) {
        match self {
            Aggregate::Address(a) => a.rebase(resyncing),
            Aggregate::Token(a) => a.rebase(resyncing),
            Aggregate::Contract(a) => a.rebase(resyncing),
        }
    }

    /// Apply one transaction; the event kind selects transfer or gas accounting
    pub fn aggregate(
        &mut self,
        tx: &TransactionInfo,
        rules: &AggregationRules,
        oracle: &dyn BalanceOracle,
    ) {
        match self {
            Aggregate::Address(a) => a.aggregate(tx, rules, oracle),
            Aggregate::Token(a) => a.aggregate(tx),
            Aggregate::Contract(a) => a.aggregate(tx),
        }
    }

    /// Daily row of `epoch`, if the aggregate changed during it
    pub fn snapshot(&self, epoch: i32) -> Option<AggregateRow> {
        match self {
            Aggregate::Address(a) => a.snapshot(epoch).map(AggregateRow::Address),
            Aggregate::Token(a) => a.snapshot(epoch).map(AggregateRow::Token),
            Aggregate::Contract(a) => a.snapshot(epoch).map(AggregateRow::Contract),
        }
    }

    /// Lifetime row, if the lifetime mirror changed since the last rebase
    pub fn snapshot_total(&self, rules: &AggregationRules) -> Option<AggregateRow> {
        match self {
            Aggregate::Address(a) => a.snapshot_total(rules).map(AggregateRow::Address),
            Aggregate::Token(a) => a.snapshot_total(rules).map(AggregateRow::Token),
            Aggregate::Contract(a) => a.snapshot_total(rules).map(AggregateRow::Contract),
        }
    }
}
