//! Token and contract aggregates
//!
//! Both track transaction counts, moved amounts, fees and distinct
//! depositors/withdrawers/counterparties. A contract aggregate over a virtual
//! token bucket counts but never sums amounts.

use crate::aggregation::context::AggregationRules;
use crate::aggregation::counter::UniqueCounter;
use crate::aggregation::decimal::{clamp, saturating_add};
use crate::aggregation::keys::AggregateKey;
use crate::aggregation::rows::{ContractRow, TokenRow};
use crate::aggregation::types::{is_virtual_contract, EventKind, TransactionInfo};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Default, PartialEq)]
struct FlowTotal {
    tx_count: i64,
    tx_amount: Decimal,
    fee_amount: Decimal,
    changed: bool,
}

/// Shared accounting of token and contract aggregates
#[derive(Debug, Clone, Default, PartialEq)]
struct FlowStats {
    counters_only: bool,
    tx_count: i64,
    tx_amount: Decimal,
    fee_amount: Decimal,
    depositors: UniqueCounter,
    withdrawers: UniqueCounter,
    counterparties: UniqueCounter,
    changed: bool,
    last_tx_hash: Option<String>,
    total: FlowTotal,
}

impl FlowStats {
    fn new(counters_only: bool, total: Option<(i64, Decimal, Decimal)>) -> Self {
        let mut stats = Self {
            counters_only,
            ..Self::default()
        };
        if let Some((tx_count, tx_amount, fee_amount)) = total {
            stats.total.tx_count = tx_count;
            stats.total.tx_amount = tx_amount;
            stats.total.fee_amount = fee_amount;
        }
        stats
    }

    fn rebase(&mut self, resyncing: bool) {
        self.tx_count = 0;
        self.tx_amount = Decimal::ZERO;
        self.fee_amount = Decimal::ZERO;
        self.depositors.clear();
        self.withdrawers.clear();
        self.counterparties.clear();
        self.changed = false;
        self.total.changed = false;
        if resyncing {
            self.last_tx_hash = None;
        }
    }

    fn aggregate(&mut self, tx: &TransactionInfo) {
        if self.last_tx_hash.as_deref() != Some(tx.tx_hash.as_str()) {
            self.last_tx_hash = Some(tx.tx_hash.clone());
            self.tx_count += 1;
            self.total.tx_count += 1;
        }

        match tx.event_kind {
            EventKind::Transfer => {
                if !self.counters_only {
                    self.tx_amount = saturating_add(self.tx_amount, tx.amount);
                    self.total.tx_amount = saturating_add(self.total.tx_amount, tx.amount);
                }
            }
            EventKind::Gas => {
                self.fee_amount = saturating_add(self.fee_amount, tx.fee);
                self.total.fee_amount = saturating_add(self.total.fee_amount, tx.fee);
            }
        }

        self.depositors.count(&tx.to_address);
        self.withdrawers.count(&tx.from_address);
        self.counterparties.count(&tx.from_address);
        self.counterparties.count(&tx.to_address);

        self.changed = true;
        self.total.changed = true;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenAggregate {
    token_contract_hash: String,
    stats: FlowStats,
}

impl TokenAggregate {
    /// Token daily rows carry nothing across epochs; only the lifetime row seeds state
    pub fn populate(token_contract_hash: impl Into<String>, total: Option<&TokenRow>) -> Self {
        Self {
            token_contract_hash: token_contract_hash.into(),
            stats: FlowStats::new(
                false,
                total.map(|row| (row.tx_count, row.tx_amount, row.fee_amount)),
            ),
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey::token(self.token_contract_hash.clone())
    }

    pub fn is_changed(&self) -> bool {
        self.stats.changed
    }

    pub fn rebase(&mut self, resyncing: bool) {
        self.stats.rebase(resyncing);
    }

    pub fn aggregate(&mut self, tx: &TransactionInfo) {
        self.stats.aggregate(tx);
    }

    pub fn snapshot(&self, epoch: i32) -> Option<TokenRow> {
        if !self.stats.changed {
            return None;
        }
        let s = &self.stats;
        Some(TokenRow {
            token_contract_hash: self.token_contract_hash.clone(),
            date_id: epoch,
            usd_price: Decimal::ZERO,
            tx_count: s.tx_count,
            tx_amount: clamp(s.tx_amount),
            deposit_address_count: s.depositors.len(),
            withdraw_address_count: s.withdrawers.len(),
            tx_address_count: s.counterparties.len(),
            fee_amount: clamp(s.fee_amount),
        })
    }

    pub fn snapshot_total(&self, rules: &AggregationRules) -> Option<TokenRow> {
        let t = &self.stats.total;
        if !t.changed {
            return None;
        }
        Some(TokenRow {
            token_contract_hash: self.token_contract_hash.clone(),
            date_id: rules.total_date_id,
            usd_price: Decimal::ZERO,
            tx_count: t.tx_count,
            tx_amount: clamp(t.tx_amount),
            deposit_address_count: 0,
            withdraw_address_count: 0,
            tx_address_count: 0,
            fee_amount: clamp(t.fee_amount),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractAggregate {
    contract_hash: String,
    token_contract_hash: String,
    stats: FlowStats,
}

impl ContractAggregate {
    pub fn populate(
        contract_hash: impl Into<String>,
        token_contract_hash: impl Into<String>,
        total: Option<&ContractRow>,
    ) -> Self {
        let token_contract_hash = token_contract_hash.into();
        Self {
            contract_hash: contract_hash.into(),
            stats: FlowStats::new(
                is_virtual_contract(&token_contract_hash),
                total.map(|row| (row.tx_count, row.tx_amount, row.fee_amount)),
            ),
            token_contract_hash,
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey::contract(self.contract_hash.clone(), self.token_contract_hash.clone())
    }

    pub fn is_changed(&self) -> bool {
        self.stats.changed
    }

    pub fn rebase(&mut self, resyncing: bool) {
        self.stats.rebase(resyncing);
    }

    pub fn aggregate(&mut self, tx: &TransactionInfo) {
        self.stats.aggregate(tx);
    }

    pub fn snapshot(&self, epoch: i32) -> Option<ContractRow> {
        if !self.stats.changed {
            return None;
        }
        let s = &self.stats;
        Some(ContractRow {
            contract_hash: self.contract_hash.clone(),
            token_contract_hash: self.token_contract_hash.clone(),
            date_id: epoch,
            usd_price: Decimal::ZERO,
            tx_count: s.tx_count,
            tx_amount: clamp(s.tx_amount),
            deposit_address_count: s.depositors.len(),
            withdraw_address_count: s.withdrawers.len(),
            tx_address_count: s.counterparties.len(),
            fee_amount: clamp(s.fee_amount),
        })
    }

    pub fn snapshot_total(&self, rules: &AggregationRules) -> Option<ContractRow> {
        let t = &self.stats.total;
        if !t.changed {
            return None;
        }
        Some(ContractRow {
            contract_hash: self.contract_hash.clone(),
            token_contract_hash: self.token_contract_hash.clone(),
            date_id: rules.total_date_id,
            usd_price: Decimal::ZERO,
            tx_count: t.tx_count,
            tx_amount: clamp(t.tx_amount),
            deposit_address_count: 0,
            withdraw_address_count: 0,
            tx_address_count: 0,
            fee_amount: clamp(t.fee_amount),
        })
    }
}
