//! Aggregation engine: the single owner of every live aggregate
//!
//! Runs on the consumer thread only. One `handle` call processes one event
//! to completion, so no aggregate or context state is ever shared.
//!
//! ## Key resolution
//!
//! ```text
//! current epoch map ──miss──▶ staging ──miss──▶ baseline cache ──miss──▶ store
//! ```
//!
//! Every key of a transaction is resolved before any of them is mutated:
//! a baseline load failure leaves the aggregates untouched.

use super::baseline::BaselineCache;
use super::context::{AggregationContext, EngineStatus};
use super::db::WatermarkStore;
use super::entity::Aggregate;
use super::error::EngineError;
use super::events::{Ack, Event};
use super::keys::AggregateKey;
use super::oracle::BalanceOracle;
use super::registry::{ContractRegistry, TokenStandard};
use super::resync::ReSync;
use super::sink::SnapshotSink;
use super::snapshot::{AggregateSnapshot, TotalAggregationSnapshot};
use super::staging::StagingArea;
use super::types::{
    format_date_id, TransactionInfo, VIRTUAL_CONTRACT_ALL, VIRTUAL_CONTRACT_NATIVE,
    VIRTUAL_CONTRACT_OEP4, VIRTUAL_CONTRACT_ORC20,
};
use std::collections::HashMap;
use std::sync::Arc;

const PROGRESS_LOG_INTERVAL: u64 = 1_000;

pub struct AggregationEngine {
    context: AggregationContext,
    registry: Arc<dyn ContractRegistry>,
    oracle: Arc<dyn BalanceOracle>,
    baseline: BaselineCache,
    watermarks: Arc<dyn WatermarkStore>,
    sink: Box<dyn SnapshotSink>,
    current: HashMap<AggregateKey, Aggregate>,
    staging: StagingArea,
    snapshot_sequence: u64,
    /// Set by every purge of live state; transactions are dropped until the
    /// live poller confirms it restarted from the persisted watermark
    rewinding: bool,
    /// The active resync lost state and must not be acknowledged as done
    resync_failed: bool,
    aggregated: u64,
    stale_dropped: u64,
}

impl AggregationEngine {
    pub fn new(
        context: AggregationContext,
        registry: Arc<dyn ContractRegistry>,
        oracle: Arc<dyn BalanceOracle>,
        baseline: BaselineCache,
        watermarks: Arc<dyn WatermarkStore>,
        sink: Box<dyn SnapshotSink>,
    ) -> Self {
        Self {
            context,
            registry,
            oracle,
            baseline,
            watermarks,
            sink,
            current: HashMap::with_capacity(16_384),
            staging: StagingArea::new(),
            snapshot_sequence: 0,
            rewinding: false,
            resync_failed: false,
            aggregated: 0,
            stale_dropped: 0,
        }
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        self.context.status()
    }

    pub fn context(&self) -> &AggregationContext {
        &self.context
    }

    /// Transactions applied since startup
    pub fn aggregated(&self) -> u64 {
        self.aggregated
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    pub fn aggregate(&self, key: &AggregateKey) -> Option<&Aggregate> {
        self.current.get(key)
    }

    pub fn handle(&mut self, event: Event) {
        log::trace!("Handling {} event", event.name());
        match event {
            Event::Transaction(tx) => self.on_transaction(tx),
            Event::StagingKeysEvicted { sequence, keys } => self.on_staging_evicted(sequence, keys),
            Event::Tick { epoch } => self.on_tick(epoch),
            Event::ResyncBegin { resync, ack } => self.on_resync_begin(resync, ack),
            Event::ResyncEnd { resync, ack } => self.on_resync_end(resync, ack),
            Event::ResyncCancel { resync } => self.on_resync_cancel(resync),
            Event::Rewound { watermark } => self.on_rewound(watermark),
        }
    }

    fn on_transaction(&mut self, tx: TransactionInfo) {
        if self.rewinding {
            log::debug!(
                "Dropping transaction {} at block {} while rewinding",
                tx.tx_hash,
                tx.block_height
            );
            return;
        }

        let epoch = self.context.epoch();
        if tx.date_id < epoch {
            self.stale_dropped += 1;
            log::warn!(
                "⚠️  Stale transaction {} at block {} dated {} (epoch {}), dropped",
                tx.tx_hash,
                tx.block_height,
                format_date_id(tx.date_id),
                format_date_id(epoch)
            );
            return;
        }

        if tx.date_id > epoch {
            if epoch != 0 {
                self.sink_snapshot();
            }
            self.context.set_epoch(tx.date_id);
        }

        if let Err(e) = self.apply(&tx) {
            log::error!(
                "❌ Aborting transaction {} at block {}: {}",
                tx.tx_hash,
                tx.block_height,
                e
            );
            self.fail();
            return;
        }

        self.context.set_block_height(tx.block_height);
        self.aggregated += 1;
        if self.aggregated % PROGRESS_LOG_INTERVAL == 0 {
            log::info!(
                "📊 {} transactions aggregated (block {}, epoch {}, {} live keys)",
                self.aggregated,
                tx.block_height,
                self.context.epoch(),
                self.current.len()
            );
        }
    }

    /// Resolve every key of `tx`, then apply it to each aggregate
    fn apply(&mut self, tx: &TransactionInfo) -> Result<(), EngineError> {
        let keys = self.select_keys(tx);
        let epoch = self.context.epoch();
        let resyncing = self.context.is_resyncing();

        let mut resolved = Vec::new();
        for key in &keys {
            if self.current.contains_key(key) {
                continue;
            }
            let aggregate = match self.staging.take(key) {
                Some(staged) => staged,
                None => match self.baseline.take(key, epoch, self.context.rules()) {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        // Put back what was already taken; the caller purges anyway
                        for (key, aggregate) in resolved {
                            self.baseline.restore(key, aggregate);
                        }
                        return Err(EngineError::Baseline(e));
                    }
                },
            };
            resolved.push((key.clone(), aggregate));
        }
        for (key, mut aggregate) in resolved {
            aggregate.rebase(resyncing);
            self.current.insert(key, aggregate);
        }

        let rules = self.context.rules();
        let oracle = self.oracle.as_ref();
        for key in &keys {
            if let Some(aggregate) = self.current.get_mut(key) {
                aggregate.aggregate(tx, rules, oracle);
            }
        }
        log::debug!("Applied {} to {} aggregates", tx.tx_hash, keys.len());
        Ok(())
    }

    /// Every aggregate key a transaction updates
    pub fn select_keys(&self, tx: &TransactionInfo) -> Vec<AggregateKey> {
        let tokens = self.token_buckets(&tx.contract_hash);

        let mut addresses = vec![tx.from_address.as_str()];
        if !tx.is_self_transaction {
            addresses.push(tx.to_address.as_str());
        }
        let mut interacted = vec![tx.contract_hash.as_str()];
        if tx.called_contract_hash != tx.contract_hash {
            interacted.push(tx.called_contract_hash.as_str());
        }

        let mut keys =
            Vec::with_capacity(addresses.len() * (tokens.len() + interacted.len()) + tokens.len() + 1);
        for address in &addresses {
            for token in &tokens {
                keys.push(AggregateKey::address(*address, token.as_str()));
            }
            for hash in &interacted {
                keys.push(AggregateKey::address_shadow(*address, *hash));
            }
        }
        keys.push(AggregateKey::token(tx.contract_hash.as_str()));
        for token in &tokens {
            keys.push(AggregateKey::contract(
                tx.called_contract_hash.as_str(),
                token.as_str(),
            ));
        }
        keys
    }

    /// The real token hash followed by the virtual buckets it belongs to
    fn token_buckets(&self, token: &str) -> Vec<String> {
        let mut tokens = vec![token.to_string(), VIRTUAL_CONTRACT_ALL.to_string()];
        if self.registry.is_native(token) {
            tokens.push(VIRTUAL_CONTRACT_NATIVE.to_string());
        }
        if self.registry.is_token_standard(token, TokenStandard::Oep4) {
            tokens.push(VIRTUAL_CONTRACT_OEP4.to_string());
        }
        if self.registry.is_token_standard(token, TokenStandard::Orc20) {
            tokens.push(VIRTUAL_CONTRACT_ORC20.to_string());
        }
        tokens
    }

    /// Move every current aggregate to staging and sink their rows
    fn sink_snapshot(&mut self) {
        self.snapshot_sequence += 1;
        let epoch = self.context.epoch();
        let mut snapshot = AggregateSnapshot::new(
            epoch,
            self.context.last_block_height(),
            self.context.active_resync().cloned(),
        )
        .with_sequence(self.snapshot_sequence);

        let rules = self.context.rules();
        for (key, aggregate) in self.current.drain() {
            snapshot.append(&key, &aggregate, rules);
            self.staging.insert(key, self.snapshot_sequence, aggregate);
        }

        log::info!(
            "📦 Sinking snapshot #{} for {} ({} keys, {} rows, block {})",
            snapshot.sequence,
            format_date_id(epoch),
            snapshot.keys.len(),
            snapshot.rows.len(),
            snapshot.last_block_height
        );
        self.sink.sink_snapshot(snapshot);
    }

    fn on_staging_evicted(&mut self, sequence: u64, keys: Vec<AggregateKey>) {
        let released = self.staging.evict(sequence, &keys);
        log::debug!(
            "Snapshot #{} durable: {} of {} staged keys back to baseline",
            sequence,
            released.len(),
            keys.len()
        );
        for (key, aggregate) in released {
            self.baseline.restore(key, aggregate);
        }
    }

    fn on_tick(&mut self, epoch: i32) {
        if self.context.is_resyncing() || self.rewinding {
            log::debug!("Tick skipped, engine is not live");
            return;
        }
        if epoch != self.context.epoch() || self.current.is_empty() {
            return;
        }

        let rules = self.context.rules();
        let mut totals = TotalAggregationSnapshot::default();
        for aggregate in self.current.values() {
            totals.append(aggregate, rules);
        }
        if totals.rows.is_empty() {
            return;
        }
        log::debug!("Sinking {} lifetime rows", totals.rows.len());
        self.sink.sink_totals(totals);
    }

    fn on_resync_begin(&mut self, resync: ReSync, ack: Ack) {
        if ack.is_closed() {
            log::warn!(
                "⚠️  Re-sync of {} no longer awaited, Begin ignored",
                resync.contract_hash
            );
            return;
        }
        log::info!(
            "🔁 Begin re-sync of {} ({} to {})",
            resync.contract_hash,
            resync.from_block,
            resync.to_block
        );
        self.context.begin_resync(resync);
        self.purge();
        self.rewinding = false;
        self.resync_failed = false;
        self.sink.forward_ack(ack);
    }

    fn on_resync_end(&mut self, resync: ReSync, ack: Ack) {
        if self.context.active_resync() != Some(&resync) {
            log::warn!(
                "⚠️  End re-sync of {} without a matching Begin, not acknowledged",
                resync.contract_hash
            );
            return;
        }

        if self.resync_failed {
            log::error!(
                "❌ Re-sync of {} lost state during replay, leaving it pending",
                resync.contract_hash
            );
            drop(ack);
        } else {
            if !self.current.is_empty() {
                self.sink_snapshot();
            }
            self.sink.forward_ack(ack);
        }

        self.context.end_resync();
        self.purge();
        self.rewind_live(true);
        self.resync_failed = false;
        log::info!("✅ End re-sync of {}", resync.contract_hash);
    }

    fn on_resync_cancel(&mut self, resync: ReSync) {
        if self.context.active_resync() != Some(&resync) {
            log::debug!("Cancel for inactive re-sync of {} ignored", resync.contract_hash);
            return;
        }
        log::warn!("⚠️  Re-sync of {} cancelled", resync.contract_hash);
        self.context.end_resync();
        self.purge();
        // A stalled writer is what lets a Begin ack time out; do not queue behind it
        self.rewind_live(false);
        self.resync_failed = false;
    }

    fn on_rewound(&mut self, watermark: i64) {
        if self.rewinding {
            log::info!("⏪ Live stream rewound to block {}, accepting transactions", watermark);
        }
        self.rewinding = false;
        self.context.reset_block_height(watermark);
    }

    /// Abandon in-memory state after a failed transaction
    fn fail(&mut self) {
        self.purge();
        if self.context.is_resyncing() {
            // End or Cancel rewinds the live stream
            self.rewinding = true;
            self.resync_failed = true;
            return;
        }
        self.rewind_live(true);
    }

    /// Drop live transactions until the poller restarts from the watermark
    ///
    /// The epoch is cleared too: the persisted watermark may lie in a day
    /// the engine already left, and the rewound stream must not be stale.
    /// With `behind_writes` the request travels through the sink so the
    /// poller reloads the watermark only after snapshots queued before it
    /// settled.
    fn rewind_live(&mut self, behind_writes: bool) {
        self.rewinding = true;
        self.context.reset_epoch();
        if behind_writes {
            self.sink.request_rewind(self.context.status());
        } else {
            self.context.status().request_rewind();
        }
    }

    /// Drop current, staged and cached aggregates and fall back to the
    /// persisted watermark
    fn purge(&mut self) {
        let discarded = self.current.len() + self.staging.len();
        self.current.clear();
        self.staging.clear();
        self.baseline.invalidate_all();

        match self.watermarks.load_watermark() {
            Ok(watermark) => self.context.reset_block_height(watermark),
            Err(e) => log::error!(
                "❌ Failed to load persisted watermark, keeping {}: {}",
                self.context.last_block_height(),
                e
            ),
        }

        log::info!(
            "🧹 Purged {} aggregates, watermark {}",
            discarded,
            self.context.last_block_height()
        );
    }
}
