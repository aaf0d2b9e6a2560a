//! Per-address, per-token aggregate
//!
//! Plain keys (real token, `for_oep = false`) carry a balance and flow
//! amounts. Virtual token buckets and `for_oep` shadow keys only count
//! transactions and distinct counterparties.

use crate::aggregation::context::AggregationRules;
use crate::aggregation::counter::UniqueCounter;
use crate::aggregation::decimal::{clamp, saturating_add, BalanceRanker};
use crate::aggregation::keys::AggregateKey;
use crate::aggregation::oracle::BalanceOracle;
use crate::aggregation::rows::{AddressRow, OEP_AGGREGATION_DATE_ID};
use crate::aggregation::types::{is_virtual_contract, EventKind, TransactionInfo};
use rust_decimal::Decimal;

/// Lifetime mirror of an address aggregate, never reset by an epoch
#[derive(Debug, Clone, Default, PartialEq)]
struct AddressTotal {
    balance: Decimal,
    deposit_tx_count: i64,
    withdraw_tx_count: i64,
    deposit_amount: Decimal,
    withdraw_amount: Decimal,
    fee_amount: Decimal,
    ranker: BalanceRanker,
    changed: bool,
}

impl AddressTotal {
    fn from_row(row: Option<&AddressRow>) -> Self {
        let mut total = Self::default();
        if let Some(row) = row {
            total.balance = row.balance;
            total.deposit_tx_count = row.deposit_tx_count;
            total.withdraw_tx_count = row.withdraw_tx_count;
            total.deposit_amount = row.deposit_amount;
            total.withdraw_amount = row.withdraw_amount;
            total.fee_amount = row.fee_amount;
            // Ranker starts at zero and absorbs the recorded extremes
            total.ranker.rank(row.max_balance);
            total.ranker.rank(row.min_balance);
        }
        total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressAggregate {
    address: String,
    token_contract_hash: String,
    for_oep: bool,
    is_virtual: bool,

    previous_balance: Decimal,
    balance: Decimal,
    deposit_tx_count: i64,
    withdraw_tx_count: i64,
    deposit_amount: Decimal,
    withdraw_amount: Decimal,
    fee_amount: Decimal,
    ranker: BalanceRanker,
    depositors: UniqueCounter,
    withdrawers: UniqueCounter,
    counterparties: UniqueCounter,
    contracts: UniqueCounter,
    changed: bool,

    /// Hash of the last transaction counted, so multi-row transactions count once
    last_tx_hash: Option<String>,

    total: AddressTotal,
}

impl AddressAggregate {
    /// Materialize an aggregate from its most recent daily row and its
    /// lifetime row; either may be absent
    pub fn populate(
        address: impl Into<String>,
        token_contract_hash: impl Into<String>,
        for_oep: bool,
        baseline: Option<&AddressRow>,
        total: Option<&AddressRow>,
    ) -> Self {
        let token_contract_hash = token_contract_hash.into();
        let balance = baseline.map(|row| row.balance).unwrap_or(Decimal::ZERO);
        Self {
            address: address.into(),
            is_virtual: is_virtual_contract(&token_contract_hash),
            token_contract_hash,
            for_oep,
            previous_balance: balance,
            balance,
            deposit_tx_count: 0,
            withdraw_tx_count: 0,
            deposit_amount: Decimal::ZERO,
            withdraw_amount: Decimal::ZERO,
            fee_amount: Decimal::ZERO,
            ranker: BalanceRanker::new(balance),
            depositors: UniqueCounter::new(),
            withdrawers: UniqueCounter::new(),
            counterparties: UniqueCounter::new(),
            contracts: UniqueCounter::new(),
            changed: false,
            last_tx_hash: None,
            total: AddressTotal::from_row(total),
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey::Address {
            address: self.address.clone(),
            token_contract_hash: self.token_contract_hash.clone(),
            for_oep: self.for_oep,
        }
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn previous_balance(&self) -> Decimal {
        self.previous_balance
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    fn counters_only(&self) -> bool {
        self.is_virtual || self.for_oep
    }

    /// Start a new epoch from the carried balance and lifetime state
    pub fn rebase(&mut self, resyncing: bool) {
        self.previous_balance = self.balance;
        self.deposit_tx_count = 0;
        self.withdraw_tx_count = 0;
        self.deposit_amount = Decimal::ZERO;
        self.withdraw_amount = Decimal::ZERO;
        self.fee_amount = Decimal::ZERO;
        self.ranker = BalanceRanker::new(self.balance);
        self.depositors.clear();
        self.withdrawers.clear();
        self.counterparties.clear();
        self.contracts.clear();
        self.changed = false;
        self.total.changed = false;
        if resyncing {
            self.last_tx_hash = None;
        }
    }

    fn is_new_tx(&mut self, tx_hash: &str) -> bool {
        if self.last_tx_hash.as_deref() == Some(tx_hash) {
            return false;
        }
        self.last_tx_hash = Some(tx_hash.to_string());
        true
    }

    pub fn aggregate(
        &mut self,
        tx: &TransactionInfo,
        rules: &AggregationRules,
        oracle: &dyn BalanceOracle,
    ) {
        self.contracts.count(&tx.contract_hash);

        let is_sender = tx.from_address == self.address;
        let is_receiver = !is_sender && tx.to_address == self.address;

        if self.counters_only() {
            if is_sender {
                if self.is_new_tx(&tx.tx_hash) {
                    self.withdraw_tx_count += 1;
                    self.total.withdraw_tx_count += 1;
                }
                self.withdrawers.count(&tx.to_address);
                self.counterparties.count(&tx.to_address);
                if tx.is_self_transaction {
                    self.depositors.count(&tx.from_address);
                }
                if tx.event_kind == EventKind::Gas {
                    self.fee_amount = saturating_add(self.fee_amount, tx.fee);
                    self.total.fee_amount = saturating_add(self.total.fee_amount, tx.fee);
                }
            } else if is_receiver {
                if self.is_new_tx(&tx.tx_hash) {
                    self.deposit_tx_count += 1;
                    self.total.deposit_tx_count += 1;
                }
                self.depositors.count(&tx.from_address);
                self.counterparties.count(&tx.from_address);
            }
        } else {
            let amount = tx.amount;
            if is_sender {
                if self.is_new_tx(&tx.tx_hash) {
                    self.withdraw_tx_count += 1;
                    self.total.withdraw_tx_count += 1;
                }
                self.withdraw_amount = saturating_add(self.withdraw_amount, amount);
                self.total.withdraw_amount = saturating_add(self.total.withdraw_amount, amount);
                self.withdrawers.count(&tx.to_address);
                self.counterparties.count(&tx.to_address);

                if tx.is_self_transaction {
                    // Balance is unchanged; both sides of the flow are recorded
                    self.deposit_amount = saturating_add(self.deposit_amount, amount);
                    self.total.deposit_amount = saturating_add(self.total.deposit_amount, amount);
                    self.depositors.count(&tx.from_address);
                } else {
                    self.settle_balance(tx, -amount, rules, oracle);
                }
            } else if is_receiver {
                if self.is_new_tx(&tx.tx_hash) {
                    self.deposit_tx_count += 1;
                    self.total.deposit_tx_count += 1;
                }
                self.settle_balance(tx, amount, rules, oracle);
                self.deposit_amount = saturating_add(self.deposit_amount, amount);
                self.total.deposit_amount = saturating_add(self.total.deposit_amount, amount);
                self.depositors.count(&tx.from_address);
                self.counterparties.count(&tx.from_address);
            }
            self.ranker.rank(self.balance);
            self.total.ranker.rank(self.total.balance);
        }

        self.changed = true;
        self.total.changed = true;
    }

    /// Apply a balance delta, or adopt the oracle balance for the native
    /// gas token past its activation block
    fn settle_balance(
        &mut self,
        tx: &TransactionInfo,
        delta: Decimal,
        rules: &AggregationRules,
        oracle: &dyn BalanceOracle,
    ) {
        if rules.requires_balance_query(&self.token_contract_hash, tx.block_height) {
            match oracle.query_balance(&self.address) {
                Ok(balance) => {
                    self.balance = balance;
                    self.total.balance = balance;
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "⚠️  Balance query for {} at block {} failed, applying delta: {}",
                        self.address,
                        tx.block_height,
                        e
                    );
                }
            }
        }
        self.balance = saturating_add(self.balance, delta);
        self.total.balance = saturating_add(self.total.balance, delta);
    }

    /// Daily row for `epoch`; shadow keys never emit one
    pub fn snapshot(&self, epoch: i32) -> Option<AddressRow> {
        if !self.changed || self.for_oep {
            return None;
        }
        Some(AddressRow {
            address: self.address.clone(),
            token_contract_hash: self.token_contract_hash.clone(),
            date_id: epoch,
            balance: clamp(self.balance),
            usd_price: Decimal::ZERO,
            max_balance: clamp(self.ranker.max()),
            min_balance: clamp(self.ranker.min()),
            deposit_tx_count: self.deposit_tx_count,
            withdraw_tx_count: self.withdraw_tx_count,
            deposit_amount: clamp(self.deposit_amount),
            withdraw_amount: clamp(self.withdraw_amount),
            deposit_address_count: self.depositors.len(),
            withdraw_address_count: self.withdrawers.len(),
            tx_address_count: self.counterparties.len(),
            fee_amount: clamp(self.fee_amount),
            contract_count: self.contracts.len(),
            is_virtual: self.is_virtual,
            previous_balance: clamp(self.previous_balance),
        })
    }

    /// Lifetime row; distinct counts are not tracked across epochs
    pub fn snapshot_total(&self, rules: &AggregationRules) -> Option<AddressRow> {
        if !self.total.changed {
            return None;
        }
        let date_id = if self.for_oep {
            OEP_AGGREGATION_DATE_ID
        } else {
            rules.total_date_id
        };
        Some(AddressRow {
            address: self.address.clone(),
            token_contract_hash: self.token_contract_hash.clone(),
            date_id,
            balance: clamp(self.total.balance),
            usd_price: Decimal::ZERO,
            max_balance: clamp(self.total.ranker.max()),
            min_balance: clamp(self.total.ranker.min()),
            deposit_tx_count: self.total.deposit_tx_count,
            withdraw_tx_count: self.total.withdraw_tx_count,
            deposit_amount: clamp(self.total.deposit_amount),
            withdraw_amount: clamp(self.total.withdraw_amount),
            deposit_address_count: 0,
            withdraw_address_count: 0,
            tx_address_count: 0,
            fee_amount: clamp(self.total.fee_amount),
            contract_count: 0,
            is_virtual: self.is_virtual,
            previous_balance: clamp(self.previous_balance),
        })
    }
}
