//! Aggregation context: epoch, watermark and resync state
//!
//! `AggregationContext` is owned by the engine and mutated only on the
//! consumer thread. Every mutation is mirrored into `EngineStatus`, a shared
//! set of atomics that producers and health checks read without locking.

use super::config::AggregationConfig;
use super::resync::ReSync;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

/// Read-only view of the engine state for other threads
#[derive(Debug, Default)]
pub struct EngineStatus {
    epoch: AtomicI32,
    last_block_height: AtomicI64,
    resyncing: AtomicBool,
    rewind_requested: AtomicBool,
}

impl EngineStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current_epoch(&self) -> i32 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn last_block_height(&self) -> i64 {
        self.last_block_height.load(Ordering::SeqCst)
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing.load(Ordering::SeqCst)
    }

    /// Ask the live poller to reload its cursor from the persisted watermark
    pub fn request_rewind(&self) {
        self.rewind_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending rewind request
    pub fn take_rewind(&self) -> bool {
        self.rewind_requested.swap(false, Ordering::SeqCst)
    }

    pub fn rewind_pending(&self) -> bool {
        self.rewind_requested.load(Ordering::SeqCst)
    }

    fn publish(&self, epoch: i32, last_block_height: i64, resyncing: bool) {
        self.epoch.store(epoch, Ordering::SeqCst);
        self.last_block_height.store(last_block_height, Ordering::SeqCst);
        self.resyncing.store(resyncing, Ordering::SeqCst);
    }
}

/// Chain-specific rules the aggregates consult while mutating
#[derive(Debug, Clone)]
pub struct AggregationRules {
    /// Date id of lifetime rows of non-shadow keys
    pub total_date_id: i32,
    /// Token whose balance is re-read from the oracle past the activation block
    pub native_gas_contract: String,
    /// 0 disables the oracle path
    pub native_activation_block: i64,
}

impl AggregationRules {
    pub fn from_config(config: &AggregationConfig) -> Self {
        Self {
            total_date_id: config.total_date_id,
            native_gas_contract: config.native_gas_contract.clone(),
            native_activation_block: config.native_activation_block,
        }
    }

    /// Returns true when a mutation of `token` at `block_height` must re-read
    /// the balance instead of applying the delta
    pub fn requires_balance_query(&self, token: &str, block_height: i64) -> bool {
        self.native_activation_block > 0
            && token == self.native_gas_contract
            && block_height >= self.native_activation_block
    }
}

impl Default for AggregationRules {
    fn default() -> Self {
        Self::from_config(&AggregationConfig::default())
    }
}

/// Epoch, watermark and resync marker of the running engine
#[derive(Debug)]
pub struct AggregationContext {
    epoch: i32,
    last_block_height: i64,
    resync: Option<ReSync>,
    /// Live epoch parked while a resync replays history from epoch 0
    parked_epoch: i32,
    rules: AggregationRules,
    status: Arc<EngineStatus>,
}

impl AggregationContext {
    pub fn new(rules: AggregationRules, status: Arc<EngineStatus>, last_block_height: i64) -> Self {
        status.publish(0, last_block_height, false);
        Self {
            epoch: 0,
            last_block_height,
            resync: None,
            parked_epoch: 0,
            rules,
            status,
        }
    }

    pub fn epoch(&self) -> i32 {
        self.epoch
    }

    /// Advance the epoch; never moves backwards
    pub fn set_epoch(&mut self, epoch: i32) {
        if epoch > self.epoch {
            self.epoch = epoch;
            self.publish();
        }
    }

    /// Clear the epoch so the next transaction starts a new epoch sequence
    ///
    /// Used after state was discarded: the re-derived stream may start on a
    /// day before the current epoch.
    pub fn reset_epoch(&mut self) {
        self.epoch = 0;
        self.publish();
    }

    pub fn last_block_height(&self) -> i64 {
        self.last_block_height
    }

    /// Record the height of the transaction that was just aggregated
    ///
    /// During a resync this follows the replayed range, which is what the
    /// resync request records as its progress.
    pub fn set_block_height(&mut self, block_height: i64) {
        self.last_block_height = block_height;
        self.publish();
    }

    /// Reset the watermark to the persisted one (purge path)
    pub fn reset_block_height(&mut self, persisted: i64) {
        self.last_block_height = persisted;
        self.publish();
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync.is_some()
    }

    pub fn active_resync(&self) -> Option<&ReSync> {
        self.resync.as_ref()
    }

    /// Enter resync mode
    ///
    /// The live epoch is parked and the epoch restarts at 0 so the first
    /// replayed day does not sink an empty snapshot.
    pub fn begin_resync(&mut self, resync: ReSync) {
        if self.resync.is_none() {
            self.parked_epoch = self.epoch;
        }
        self.epoch = 0;
        self.resync = Some(resync);
        self.publish();
    }

    /// Leave resync mode and restore the parked live epoch
    pub fn end_resync(&mut self) -> Option<ReSync> {
        let finished = self.resync.take();
        if finished.is_some() {
            self.epoch = self.parked_epoch;
            self.parked_epoch = 0;
        }
        self.publish();
        finished
    }

    pub fn rules(&self) -> &AggregationRules {
        &self.rules
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        self.status.clone()
    }

    fn publish(&self) {
        self.status
            .publish(self.epoch, self.last_block_height, self.resync.is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AggregationContext {
        AggregationContext::new(AggregationRules::default(), EngineStatus::new(), 42)
    }

    #[test]
    fn test_epoch_never_moves_backwards() {
        let mut ctx = context();
        ctx.set_epoch(20230102);
        ctx.set_epoch(20230101);
        assert_eq!(ctx.epoch(), 20230102);
        assert_eq!(ctx.status().current_epoch(), 20230102);
    }

    #[test]
    fn test_reset_epoch_allows_earlier_day() {
        let mut ctx = context();
        ctx.set_epoch(20230102);
        ctx.reset_epoch();
        assert_eq!(ctx.status().current_epoch(), 0);
        ctx.set_epoch(20230101);
        assert_eq!(ctx.epoch(), 20230101);
    }

    #[test]
    fn test_resync_parks_and_restores_epoch() {
        // Test: replay starts from epoch 0 and live epoch comes back afterwards
        let mut ctx = context();
        ctx.set_epoch(20230105);

        ctx.begin_resync(ReSync::new("C", 1, 100));
        assert!(ctx.is_resyncing());
        assert!(ctx.status().is_resyncing());
        assert_eq!(ctx.epoch(), 0);

        ctx.set_epoch(20230101);
        let finished = ctx.end_resync();
        assert_eq!(finished.map(|r| r.contract_hash), Some("C".to_string()));
        assert_eq!(ctx.epoch(), 20230105);
        assert!(!ctx.status().is_resyncing());
    }

    #[test]
    fn test_end_without_begin_keeps_epoch() {
        let mut ctx = context();
        ctx.set_epoch(20230105);
        assert!(ctx.end_resync().is_none());
        assert_eq!(ctx.epoch(), 20230105);
    }

    #[test]
    fn test_rewind_flag_is_consumed_once() {
        let status = EngineStatus::new();
        status.request_rewind();
        assert!(status.take_rewind());
        assert!(!status.take_rewind());
    }

    #[test]
    fn test_balance_query_rule() {
        let mut rules = AggregationRules::default();
        let gas = rules.native_gas_contract.clone();
        assert!(!rules.requires_balance_query(&gas, 1_000));

        rules.native_activation_block = 500;
        assert!(rules.requires_balance_query(&gas, 500));
        assert!(!rules.requires_balance_query(&gas, 499));
        assert!(!rules.requires_balance_query("other", 1_000));
    }
}
