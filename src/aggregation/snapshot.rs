//! Snapshot batches handed to the sink

use super::context::AggregationRules;
use super::entity::Aggregate;
use super::keys::AggregateKey;
use super::resync::ReSync;
use super::rows::{AddressRow, AggregateRow, ContractRow, TokenRow};

/// Rows of one entity kind each, in emission order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotRows {
    pub address_rows: Vec<AddressRow>,
    pub token_rows: Vec<TokenRow>,
    pub contract_rows: Vec<ContractRow>,
}

impl SnapshotRows {
    fn push(&mut self, row: AggregateRow) {
        match row {
            AggregateRow::Address(r) => self.address_rows.push(r),
            AggregateRow::Token(r) => self.token_rows.push(r),
            AggregateRow::Contract(r) => self.contract_rows.push(r),
        }
    }

    pub fn len(&self) -> usize {
        self.address_rows.len() + self.token_rows.len() + self.contract_rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Epoch snapshot: daily and lifetime rows of every changed aggregate
///
/// `keys` lists every aggregate moved to staging by this snapshot, changed
/// or not, so the writer can acknowledge them all once rows are durable.
/// `sequence` numbers the engine's snapshots in sink order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub sequence: u64,
    pub epoch: i32,
    pub last_block_height: i64,
    pub resync: Option<ReSync>,
    pub keys: Vec<AggregateKey>,
    pub rows: SnapshotRows,
}

impl AggregateSnapshot {
    pub fn new(epoch: i32, last_block_height: i64, resync: Option<ReSync>) -> Self {
        Self {
            sequence: 0,
            epoch,
            last_block_height,
            resync,
            keys: Vec::new(),
            rows: SnapshotRows::default(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn append(&mut self, key: &AggregateKey, aggregate: &Aggregate, rules: &AggregationRules) {
        self.keys.push(key.clone());
        if let Some(row) = aggregate.snapshot(self.epoch) {
            self.rows.push(row);
        }
        if let Some(row) = aggregate.snapshot_total(rules) {
            self.rows.push(row);
        }
    }

    pub fn is_resync(&self) -> bool {
        self.resync.is_some()
    }
}

/// Lifetime rows only, flushed on the timer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TotalAggregationSnapshot {
    pub rows: SnapshotRows,
}

impl TotalAggregationSnapshot {
    pub fn append(&mut self, aggregate: &Aggregate, rules: &AggregationRules) {
        if let Some(row) = aggregate.snapshot_total(rules) {
            self.rows.push(row);
        }
    }
}
