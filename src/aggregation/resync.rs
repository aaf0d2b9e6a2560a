//! Resync rendezvous: pause live ingestion, replay one contract, resume
//!
//! ## Protocol
//!
//! ```text
//! Idle ──dispatch Begin──▶ AwaitingBeginAck ──ack──▶ Replaying
//!   ▲                           │ timeout: dispatch Cancel
//!   │                           ▼
//!   └──────── ack ◀── AwaitingEndAck ◀──dispatch End── (replay done)
//! ```
//!
//! Begin and End acknowledgments travel through the snapshot sink, so they
//! arrive only after every snapshot enqueued before them is durable.
//!
//! Tx count repairs reuse the rendezvous with an empty range: the engine
//! drops its cached lifetime aggregates at Begin, the store rewrites the
//! rows, and End rewinds live ingestion onto them.

use super::context::EngineStatus;
use super::db::{RangeQuery, ResyncRequests, TransactionSource, WatermarkStore};
use super::dispatcher::Dispatcher;
use super::error::ResyncError;
use super::events::Event;
use super::source::{LiveGate, RateLimiter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval, timeout};

/// Block range of one contract to re-derive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReSync {
    pub contract_hash: String,
    pub from_block: i64,
    pub to_block: i64,
}

impl ReSync {
    pub fn new(contract_hash: impl Into<String>, from_block: i64, to_block: i64) -> Self {
        Self {
            contract_hash: contract_hash.into(),
            from_block,
            to_block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncState {
    Idle,
    AwaitingBeginAck,
    Replaying,
    AwaitingEndAck,
}

/// Persisted status of a resync request (`contract.re_sync_status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncStatus {
    Pending,
    Done,
    /// Lifetime tx counts of the contract's addresses need rebuilding
    RepairPending,
}

impl ResyncStatus {
    pub fn code(&self) -> i64 {
        match self {
            ResyncStatus::Pending => 2,
            ResyncStatus::Done => 3,
            ResyncStatus::RepairPending => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2 => Some(ResyncStatus::Pending),
            3 => Some(ResyncStatus::Done),
            4 => Some(ResyncStatus::RepairPending),
            _ => None,
        }
    }
}

/// Resync request record polled by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub contract_hash: String,
    pub status: ResyncStatus,
    pub from_block: i64,
    pub to_block: i64,
    /// Progress of previous cycles; replay resumes after this height
    pub last_replayed_block: i64,
}

impl ResyncRequest {
    pub fn resync(&self) -> ReSync {
        ReSync::new(self.contract_hash.clone(), self.from_block, self.to_block)
    }

    /// Exclusive lower and inclusive upper replay bound given the persisted watermark
    pub fn replay_range(&self, watermark: i64) -> (i64, i64) {
        let begin = (self.from_block - 1).max(self.last_replayed_block);
        let end = self.to_block.min(watermark);
        (begin, end)
    }
}

/// How one request was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Empty range, marked done without replay
    Skipped,
    Completed { replayed: usize },
}

/// Producer side of the rendezvous
///
/// Drives every pending request in turn while the live poller is gated off.
pub struct ResyncCoordinator {
    dispatcher: Dispatcher,
    source: Arc<dyn TransactionSource>,
    requests: Arc<dyn ResyncRequests>,
    watermarks: Arc<dyn WatermarkStore>,
    gate: Arc<LiveGate>,
    status: Arc<EngineStatus>,
    limiter: Option<RateLimiter>,
    block_batch_size: i64,
    ack_timeout: Duration,
    total_date_id: i32,
    state: ResyncState,
}

impl ResyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Dispatcher,
        source: Arc<dyn TransactionSource>,
        requests: Arc<dyn ResyncRequests>,
        watermarks: Arc<dyn WatermarkStore>,
        gate: Arc<LiveGate>,
        status: Arc<EngineStatus>,
        limiter: Option<RateLimiter>,
        block_batch_size: i64,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            source,
            requests,
            watermarks,
            gate,
            status,
            limiter,
            block_batch_size,
            ack_timeout,
            total_date_id: -1,
            state: ResyncState::Idle,
        }
    }

    /// Date id of the lifetime rows a tx count repair rewrites
    pub fn with_total_date_id(mut self, total_date_id: i32) -> Self {
        self.total_date_id = total_date_id;
        self
    }

    pub fn state(&self) -> ResyncState {
        self.state
    }

    /// Scheduler loop: one pass per `period`
    pub async fn run(mut self, period: Duration) {
        log::info!("🔄 Resync scheduler started (every {}s)", period.as_secs());
        let mut timer = interval(period);
        loop {
            timer.tick().await;
            match self.run_pass().await {
                Ok(0) => {}
                Ok(n) => log::info!("✅ Resync pass settled {} request(s)", n),
                Err(ResyncError::Dispatch(_)) => {
                    log::info!("Resync scheduler stopping (dispatcher closed)");
                    return;
                }
                Err(e) => log::error!("❌ Resync pass failed: {}", e),
            }
            match self.run_repair_pass().await {
                Ok(0) => {}
                Ok(n) => log::info!("✅ Repair pass settled {} contract(s)", n),
                Err(ResyncError::Dispatch(_)) => {
                    log::info!("Resync scheduler stopping (dispatcher closed)");
                    return;
                }
                Err(e) => log::error!("❌ Repair pass failed: {}", e),
            }
        }
    }

    /// Process every pending request; returns how many were settled
    pub async fn run_pass(&mut self) -> Result<usize, ResyncError> {
        let pending = self.requests.pending_requests().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        log::info!("🔁 {} contract(s) waiting for re-sync", pending.len());
        self.gate.suspend().await;
        let mut settled = 0;
        let mut result = Ok(());
        for request in &pending {
            match self.resync(request).await {
                Ok(_) => settled += 1,
                Err(ResyncError::Dispatch(e)) => {
                    result = Err(ResyncError::Dispatch(e));
                    break;
                }
                // Timeouts and store errors leave the request pending for a later pass
                Err(e) => log::error!("❌ {}", e),
            }
        }
        self.state = ResyncState::Idle;
        self.gate.resume();
        result.map(|_| settled)
    }

    pub async fn resync(&mut self, request: &ResyncRequest) -> Result<ResyncOutcome, ResyncError> {
        let hash = request.contract_hash.clone();
        if request.from_block == 0 && request.to_block == 0 {
            log::info!("Contract {} has been fully synchronized", hash);
            self.requests.set_status(&hash, ResyncStatus::Done).await?;
            return Ok(ResyncOutcome::Skipped);
        }

        let resync = request.resync();
        self.begin(&resync).await?;

        let watermark = self.watermarks.load_watermark()?;
        let (mut begin, end) = request.replay_range(watermark);
        let mut replayed = 0;
        if begin < end {
            log::info!("▶️  Re-sync of contract {} from {} to {}", hash, begin, end);
            while begin < end {
                let up_to = (begin + self.block_batch_size).min(end);
                let rows = self
                    .source
                    .fetch_range(&RangeQuery::resync(begin, up_to, &hash))
                    .await?;
                log::info!(
                    "   ├─ {} transaction(s) in ({}, {}]",
                    rows.len(),
                    begin,
                    up_to
                );
                if rows.is_empty() {
                    begin = up_to;
                    continue;
                }
                for tx in rows {
                    if let Some(limiter) = self.limiter.as_mut() {
                        limiter.acquire().await;
                    }
                    self.dispatcher.dispatch(Event::Transaction(tx)).await?;
                    replayed += 1;
                }
                begin = up_to;
            }
        } else {
            log::info!(
                "No aggregated transactions of {} in range, nothing to replay",
                hash
            );
        }

        self.end(resync).await?;

        self.requests.set_status(&hash, ResyncStatus::Done).await?;
        self.state = ResyncState::Idle;
        log::info!(
            "✅ Re-sync of contract {} finished ({} transactions, watermark {})",
            hash,
            replayed,
            self.status.last_block_height()
        );
        Ok(ResyncOutcome::Completed { replayed })
    }

    /// Repair every contract flagged for it; returns how many were settled
    pub async fn run_repair_pass(&mut self) -> Result<usize, ResyncError> {
        let contracts = self.requests.repair_requests().await?;
        if contracts.is_empty() {
            return Ok(0);
        }

        log::info!("🔧 {} contract(s) waiting for tx count repair", contracts.len());
        self.gate.suspend().await;
        let mut settled = 0;
        let mut result = Ok(());
        for hash in &contracts {
            match self.repair(hash).await {
                Ok(_) => settled += 1,
                Err(ResyncError::Dispatch(e)) => {
                    result = Err(ResyncError::Dispatch(e));
                    break;
                }
                Err(e) => log::error!("❌ {}", e),
            }
        }
        self.state = ResyncState::Idle;
        self.gate.resume();
        result.map(|_| settled)
    }

    /// Rebuild one contract's lifetime tx counts inside the rendezvous
    pub async fn repair(&mut self, contract_hash: &str) -> Result<usize, ResyncError> {
        let resync = ReSync::new(contract_hash, 0, 0);
        self.begin(&resync).await?;

        let repaired = match self
            .requests
            .repair_tx_counts(contract_hash, self.total_date_id)
            .await
        {
            Ok(repaired) => repaired,
            Err(e) => {
                self.dispatcher
                    .dispatch(Event::ResyncCancel { resync })
                    .await?;
                self.state = ResyncState::Idle;
                return Err(e.into());
            }
        };
        log::info!("   ├─ {} lifetime row(s) of {} rewritten", repaired, contract_hash);

        self.end(resync).await?;
        self.requests
            .set_status(contract_hash, ResyncStatus::Done)
            .await?;
        self.state = ResyncState::Idle;
        log::info!("✅ Tx counts of contract {} repaired", contract_hash);
        Ok(repaired)
    }

    /// Dispatch Begin and wait for the engine to enter the resync
    async fn begin(&mut self, resync: &ReSync) -> Result<(), ResyncError> {
        self.state = ResyncState::AwaitingBeginAck;
        let (ack, begun) = oneshot::channel();
        self.dispatcher
            .dispatch(Event::ResyncBegin {
                resync: resync.clone(),
                ack,
            })
            .await?;
        if !matches!(timeout(self.ack_timeout, begun).await, Ok(Ok(()))) {
            // Dropping the receiver makes a still-queued Begin a no-op; Cancel
            // undoes one the consumer already entered
            self.dispatcher
                .dispatch(Event::ResyncCancel {
                    resync: resync.clone(),
                })
                .await?;
            self.state = ResyncState::Idle;
            return Err(ResyncError::BeginTimeout(resync.contract_hash.clone()));
        }
        self.state = ResyncState::Replaying;
        Ok(())
    }

    /// Dispatch End and wait until every replayed snapshot is durable
    async fn end(&mut self, resync: ReSync) -> Result<(), ResyncError> {
        let hash = resync.contract_hash.clone();
        self.state = ResyncState::AwaitingEndAck;
        let (ack, ended) = oneshot::channel();
        self.dispatcher
            .dispatch(Event::ResyncEnd { resync, ack })
            .await?;
        match timeout(self.ack_timeout, ended).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.state = ResyncState::Idle;
                Err(ResyncError::EndTimeout(hash))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::error::StoreError;
    use crate::aggregation::test_support::transfer;
    use crate::aggregation::types::TransactionInfo;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const ACK_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordedRequests {
        pending: Vec<ResyncRequest>,
        repairs: Vec<String>,
        statuses: Mutex<Vec<(String, ResyncStatus)>>,
        repaired: Mutex<Vec<String>>,
    }

    impl RecordedRequests {
        fn statuses(&self) -> Vec<(String, ResyncStatus)> {
            self.statuses.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResyncRequests for RecordedRequests {
        async fn pending_requests(&self) -> Result<Vec<ResyncRequest>, StoreError> {
            Ok(self.pending.clone())
        }

        async fn set_status(&self, contract_hash: &str, status: ResyncStatus) -> Result<(), StoreError> {
            self.statuses
                .lock()
                .unwrap()
                .push((contract_hash.to_string(), status));
            Ok(())
        }

        async fn repair_requests(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.repairs.clone())
        }

        async fn repair_tx_counts(
            &self,
            contract_hash: &str,
            _total_date_id: i32,
        ) -> Result<usize, StoreError> {
            self.repaired.lock().unwrap().push(contract_hash.to_string());
            Ok(2)
        }
    }

    struct StaticSource(Vec<TransactionInfo>);

    #[async_trait]
    impl TransactionSource for StaticSource {
        async fn latest_block_height(&self) -> Result<Option<i64>, StoreError> {
            Ok(self.0.iter().map(|t| t.block_height).max())
        }

        async fn fetch_range(&self, query: &RangeQuery) -> Result<Vec<TransactionInfo>, StoreError> {
            Ok(self
                .0
                .iter()
                .filter(|t| t.block_height > query.after && t.block_height <= query.up_to)
                .cloned()
                .collect())
        }
    }

    struct FixedWatermark(i64);

    impl WatermarkStore for FixedWatermark {
        fn load_watermark(&self) -> Result<i64, StoreError> {
            Ok(self.0)
        }
    }

    /// How the scripted consumer answers a rendezvous event
    #[derive(Clone, Copy)]
    enum Reply {
        Ack,
        /// Drop the sender, as the engine does after a failed replay
        Refuse,
        /// Keep the sender alive without answering
        Hold,
    }

    fn consumer(
        mut rx: mpsc::Receiver<Event>,
        begin: Reply,
        end: Reply,
    ) -> JoinHandle<Vec<&'static str>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut held = Vec::new();
            while let Some(event) = rx.recv().await {
                seen.push(event.name());
                let (ack, reply) = match event {
                    Event::ResyncBegin { ack, .. } => (ack, begin),
                    Event::ResyncEnd { ack, .. } => (ack, end),
                    _ => continue,
                };
                match reply {
                    Reply::Ack => {
                        let _ = ack.send(());
                    }
                    Reply::Refuse => drop(ack),
                    Reply::Hold => held.push(ack),
                }
            }
            seen
        })
    }

    fn coordinator(
        requests: Arc<RecordedRequests>,
        begin: Reply,
        end: Reply,
    ) -> (ResyncCoordinator, Arc<LiveGate>, JoinHandle<Vec<&'static str>>) {
        let (dispatcher, rx) = Dispatcher::channel(8);
        let gate = LiveGate::new();
        let source = StaticSource(vec![
            transfer("h1", 5, "X", "Y", "C", 1),
            transfer("h2", 8, "Y", "Z", "C", 1),
        ]);
        let coordinator = ResyncCoordinator::new(
            dispatcher,
            Arc::new(source),
            requests,
            Arc::new(FixedWatermark(20)),
            gate.clone(),
            EngineStatus::new(),
            None,
            10,
            ACK_TIMEOUT,
        );
        (coordinator, gate, consumer(rx, begin, end))
    }

    fn pending(contract_hash: &str) -> Arc<RecordedRequests> {
        Arc::new(RecordedRequests {
            pending: vec![ResyncRequest {
                contract_hash: contract_hash.to_string(),
                status: ResyncStatus::Pending,
                from_block: 1,
                to_block: 10,
                last_replayed_block: 0,
            }],
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_resync_marks_request_done() {
        let requests = pending("C");
        let (mut coordinator, gate, consumer) = coordinator(requests.clone(), Reply::Ack, Reply::Ack);

        assert_eq!(coordinator.run_pass().await.unwrap(), 1);
        assert_eq!(requests.statuses(), vec![("C".to_string(), ResyncStatus::Done)]);
        assert!(!gate.is_suspended());

        drop(coordinator);
        assert_eq!(
            consumer.await.unwrap(),
            vec!["resync_begin", "transaction", "transaction", "resync_end"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_timeout_leaves_request_pending() {
        // Test: an unanswered End times out, the request stays pending and live reopens
        let requests = pending("C");
        let (mut coordinator, gate, consumer) =
            coordinator(requests.clone(), Reply::Ack, Reply::Hold);

        let started = tokio::time::Instant::now();
        assert_eq!(coordinator.run_pass().await.unwrap(), 0);
        assert!(started.elapsed() >= ACK_TIMEOUT);
        assert!(requests.statuses().is_empty());
        assert!(!gate.is_suspended());
        assert_eq!(coordinator.state(), ResyncState::Idle);

        drop(coordinator);
        assert_eq!(consumer.await.unwrap().last(), Some(&"resync_end"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replay_is_not_marked_done() {
        // Test: a dropped End acknowledgment settles nothing
        let requests = pending("C");
        let (mut coordinator, gate, _consumer) =
            coordinator(requests.clone(), Reply::Ack, Reply::Refuse);

        let request = requests.pending[0].clone();
        let result = coordinator.resync(&request).await;
        assert!(matches!(result, Err(ResyncError::EndTimeout(ref hash)) if hash == "C"));
        assert!(requests.statuses().is_empty());
        assert_eq!(coordinator.state(), ResyncState::Idle);

        // A full pass over the same request settles nothing either
        assert_eq!(coordinator.run_pass().await.unwrap(), 0);
        assert!(requests.statuses().is_empty());
        assert!(!gate.is_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_timeout_cancels() {
        let requests = pending("C");
        let (mut coordinator, _gate, consumer) =
            coordinator(requests.clone(), Reply::Hold, Reply::Ack);

        assert_eq!(coordinator.run_pass().await.unwrap(), 0);
        assert!(requests.statuses().is_empty());

        drop(coordinator);
        assert_eq!(consumer.await.unwrap(), vec!["resync_begin", "resync_cancel"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_without_requests_leaves_gate_alone() {
        let requests = Arc::new(RecordedRequests::default());
        let (mut coordinator, gate, consumer) =
            coordinator(requests.clone(), Reply::Ack, Reply::Ack);

        assert_eq!(coordinator.run_pass().await.unwrap(), 0);
        assert_eq!(coordinator.run_repair_pass().await.unwrap(), 0);
        assert!(!gate.is_suspended());

        drop(coordinator);
        assert!(consumer.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_runs_inside_rendezvous() {
        // Test: the repair happens between Begin and End, then the contract is done
        let requests = Arc::new(RecordedRequests {
            repairs: vec!["C".to_string()],
            ..Default::default()
        });
        let (mut coordinator, gate, consumer) =
            coordinator(requests.clone(), Reply::Ack, Reply::Ack);

        assert_eq!(coordinator.run_repair_pass().await.unwrap(), 1);
        assert_eq!(*requests.repaired.lock().unwrap(), vec!["C".to_string()]);
        assert_eq!(requests.statuses(), vec![("C".to_string(), ResyncStatus::Done)]);
        assert!(!gate.is_suspended());

        drop(coordinator);
        assert_eq!(consumer.await.unwrap(), vec!["resync_begin", "resync_end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_repair_stays_flagged() {
        let requests = Arc::new(RecordedRequests {
            repairs: vec!["C".to_string()],
            ..Default::default()
        });
        let (mut coordinator, _gate, _consumer) =
            coordinator(requests.clone(), Reply::Ack, Reply::Hold);

        assert_eq!(coordinator.run_repair_pass().await.unwrap(), 0);
        assert!(requests.statuses().is_empty());
    }

    fn request(from: i64, to: i64, last: i64) -> ResyncRequest {
        ResyncRequest {
            contract_hash: "C".to_string(),
            status: ResyncStatus::Pending,
            from_block: from,
            to_block: to,
            last_replayed_block: last,
        }
    }

    #[test]
    fn test_replay_range() {
        assert_eq!(request(10, 100, 0).replay_range(1_000), (9, 100));
        assert_eq!(request(10, 100, 0).replay_range(50), (9, 50));
        assert_eq!(request(10, 100, 60).replay_range(1_000), (60, 100));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ResyncStatus::from_code(2), Some(ResyncStatus::Pending));
        assert_eq!(ResyncStatus::Done.code(), 3);
        assert_eq!(ResyncStatus::from_code(4), Some(ResyncStatus::RepairPending));
        assert_eq!(ResyncStatus::from_code(0), None);
    }
}
