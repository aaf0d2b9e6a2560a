//! Shared fixtures for unit tests

use super::baseline::BaselineCache;
use super::context::{AggregationContext, AggregationRules, EngineStatus};
use super::db::{BaselineStore, ContractDirectory, WatermarkStore};
use super::engine::AggregationEngine;
use super::error::{OracleError, StoreError};
use super::events::Ack;
use super::oracle::BalanceOracle;
use super::registry::{ContractRegistry, TokenStandard};
use super::rows::{AddressRow, ContractRow, TokenRow};
use super::sink::SnapshotSink;
use super::snapshot::{AggregateSnapshot, TotalAggregationSnapshot};
use super::types::{EventKind, TransactionInfo};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 2023-01-01T00:00:00Z
pub const DAY_ONE: i64 = 1_672_531_200;

/// Transfer of `amount` on `token`, invoked through the token contract itself
pub fn transfer(
    hash: &str,
    height: i64,
    from: &str,
    to: &str,
    token: &str,
    amount: i64,
) -> TransactionInfo {
    TransactionInfo::new(
        hash,
        height,
        0,
        0,
        DAY_ONE,
        EventKind::Transfer,
        from,
        to,
        token,
        token,
        Decimal::from(amount),
        Decimal::ZERO,
    )
}

pub fn address_row(address: &str, token: &str, date_id: i32, balance: i64) -> AddressRow {
    let balance = Decimal::from(balance);
    AddressRow {
        address: address.to_string(),
        token_contract_hash: token.to_string(),
        date_id,
        balance,
        usd_price: Decimal::ZERO,
        max_balance: balance,
        min_balance: balance,
        deposit_tx_count: 1,
        withdraw_tx_count: 0,
        deposit_amount: balance,
        withdraw_amount: Decimal::ZERO,
        deposit_address_count: 1,
        withdraw_address_count: 0,
        tx_address_count: 1,
        fee_amount: Decimal::ZERO,
        contract_count: 1,
        is_virtual: false,
        previous_balance: Decimal::ZERO,
    }
}

/// Oracle with a fixed answer that counts its calls
pub struct ScriptedOracle {
    balance: Option<Decimal>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn failing() -> Self {
        Self {
            balance: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn returning(balance: Decimal) -> Self {
        Self {
            balance: Some(balance),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BalanceOracle for ScriptedOracle {
    fn query_balance(&self, _address: &str) -> Result<Decimal, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.balance
            .ok_or_else(|| OracleError::Malformed("scripted failure".to_string()))
    }
}

/// In-memory baseline, watermark and directory store
///
/// `baseline_loads` counts key materializations: one per address baseline,
/// token total or contract total lookup.
#[derive(Default)]
pub struct MemoryStore {
    addresses: Mutex<Vec<AddressRow>>,
    tokens: Mutex<Vec<TokenRow>>,
    contracts: Mutex<Vec<ContractRow>>,
    standards: Mutex<HashMap<String, TokenStandard>>,
    watermark: AtomicI64,
    loads: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn put_address(&self, row: AddressRow) {
        self.addresses.lock().unwrap().push(row);
    }

    pub fn set_watermark(&self, height: i64) {
        self.watermark.store(height, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn baseline_loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Decode("store offline".to_string()));
        }
        Ok(())
    }
}

impl BaselineStore for MemoryStore {
    fn load_address_baseline(
        &self,
        address: &str,
        token_contract_hash: &str,
        before_epoch: i32,
    ) -> Result<Option<AddressRow>, StoreError> {
        self.check()?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        let rows = self.addresses.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| {
                r.address == address
                    && r.token_contract_hash == token_contract_hash
                    && r.date_id > 0
                    && r.date_id < before_epoch
            })
            .max_by_key(|r| r.date_id)
            .cloned())
    }

    fn load_address_total(
        &self,
        address: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<AddressRow>, StoreError> {
        self.check()?;
        let rows = self.addresses.lock().unwrap();
        Ok(rows
            .iter()
            .find(|r| {
                r.address == address
                    && r.token_contract_hash == token_contract_hash
                    && r.date_id == date_id
            })
            .cloned())
    }

    fn load_token_total(
        &self,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<TokenRow>, StoreError> {
        self.check()?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        let rows = self.tokens.lock().unwrap();
        Ok(rows
            .iter()
            .find(|r| r.token_contract_hash == token_contract_hash && r.date_id == date_id)
            .cloned())
    }

    fn load_contract_total(
        &self,
        contract_hash: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<ContractRow>, StoreError> {
        self.check()?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        let rows = self.contracts.lock().unwrap();
        Ok(rows
            .iter()
            .find(|r| {
                r.contract_hash == contract_hash
                    && r.token_contract_hash == token_contract_hash
                    && r.date_id == date_id
            })
            .cloned())
    }
}

impl WatermarkStore for MemoryStore {
    fn load_watermark(&self) -> Result<i64, StoreError> {
        Ok(self.watermark.load(Ordering::SeqCst))
    }
}

impl ContractDirectory for MemoryStore {
    fn token_standard(&self, contract_hash: &str) -> Result<Option<TokenStandard>, StoreError> {
        self.check()?;
        Ok(self.standards.lock().unwrap().get(contract_hash).copied())
    }
}

/// Registry with hand-assigned classifications
#[derive(Default)]
pub struct StaticRegistry {
    native: Mutex<HashSet<String>>,
    standards: Mutex<HashMap<String, TokenStandard>>,
}

impl StaticRegistry {
    pub fn add_native(&self, hash: &str) {
        self.native.lock().unwrap().insert(hash.to_string());
    }

    pub fn add_standard(&self, hash: &str, standard: TokenStandard) {
        self.standards.lock().unwrap().insert(hash.to_string(), standard);
    }
}

impl ContractRegistry for StaticRegistry {
    fn is_native(&self, hash: &str) -> bool {
        self.native.lock().unwrap().contains(hash)
    }

    fn is_token_standard(&self, hash: &str, standard: TokenStandard) -> bool {
        self.standards.lock().unwrap().get(hash) == Some(&standard)
    }
}

#[derive(Debug, Clone)]
pub enum SinkRecord {
    Snapshot(AggregateSnapshot),
    Totals(TotalAggregationSnapshot),
    Ack,
    Rewind,
}

/// Shared view of what a `RecordingSink` received
#[derive(Clone, Default)]
pub struct SinkLog {
    records: Arc<Mutex<Vec<SinkRecord>>>,
}

impl SinkLog {
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().unwrap().clone()
    }
}

/// Sink that records everything and acknowledges immediately
pub struct RecordingSink {
    log: SinkLog,
}

impl SnapshotSink for RecordingSink {
    fn sink_snapshot(&mut self, snapshot: AggregateSnapshot) {
        self.log.records.lock().unwrap().push(SinkRecord::Snapshot(snapshot));
    }

    fn sink_totals(&mut self, snapshot: TotalAggregationSnapshot) {
        self.log.records.lock().unwrap().push(SinkRecord::Totals(snapshot));
    }

    fn forward_ack(&mut self, ack: Ack) {
        self.log.records.lock().unwrap().push(SinkRecord::Ack);
        let _ = ack.send(());
    }

    fn request_rewind(&mut self, status: Arc<EngineStatus>) {
        self.log.records.lock().unwrap().push(SinkRecord::Rewind);
        status.request_rewind();
    }
}

pub struct EngineFixture {
    pub engine: AggregationEngine,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<StaticRegistry>,
    pub sink: SinkLog,
}

/// Engine over in-memory collaborators, default rules, watermark 0
pub fn engine_fixture() -> EngineFixture {
    let store = Arc::new(MemoryStore::default());
    let registry = Arc::new(StaticRegistry::default());
    let sink = SinkLog::default();
    let context = AggregationContext::new(AggregationRules::default(), EngineStatus::new(), 0);
    let engine = AggregationEngine::new(
        context,
        registry.clone(),
        Arc::new(ScriptedOracle::failing()),
        BaselineCache::new(store.clone(), 10_000, Duration::from_secs(600)),
        store.clone(),
        Box::new(RecordingSink { log: sink.clone() }),
    );
    EngineFixture {
        engine,
        store,
        registry,
        sink,
    }
}
