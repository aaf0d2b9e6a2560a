//! Producers feeding the dispatcher: live poller, tick producer, rate limiter
//!
//! The live poller walks `tx_detail` from its cursor in block-range pages.
//! It pauses at a block boundary whenever the resync coordinator closes the
//! `LiveGate` or the engine asks for a rewind, so a block is never split.

use super::context::EngineStatus;
use super::db::{RangeQuery, TransactionSource, WatermarkStore};
use super::dispatcher::Dispatcher;
use super::error::IngestError;
use super::events::Event;
use super::types::current_date_id;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Switch the resync coordinator uses to pause live ingestion
///
/// `suspend` waits until the poller has left the page it was dispatching,
/// so nothing live is enqueued after it returns.
#[derive(Debug, Default)]
pub struct LiveGate {
    suspended: AtomicBool,
    in_flight: Mutex<()>,
}

impl LiveGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        let _drained = self.in_flight.lock().await;
        log::info!("⏸️  Live ingestion suspended");
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        log::info!("▶️  Live ingestion resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Enter a dispatching section; `None` while suspended
    pub async fn admit(&self) -> Option<MutexGuard<'_, ()>> {
        if self.is_suspended() {
            return None;
        }
        let guard = self.in_flight.lock().await;
        if self.is_suspended() {
            return None;
        }
        Some(guard)
    }
}

/// Fixed-rate pacing for dispatched transactions
pub struct RateLimiter {
    ticks: Interval,
}

impl RateLimiter {
    /// `None` when `rate` is not a positive number (limiter disabled)
    pub fn per_second(rate: f64) -> Option<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return None;
        }
        let period = Duration::from_secs_f64(1.0 / rate).max(Duration::from_nanos(1));
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(Self { ticks })
    }

    pub async fn acquire(&mut self) {
        self.ticks.tick().await;
    }
}

/// Live block-range poller
pub struct LivePoller {
    dispatcher: Dispatcher,
    source: Arc<dyn TransactionSource>,
    watermarks: Arc<dyn WatermarkStore>,
    gate: Arc<LiveGate>,
    status: Arc<EngineStatus>,
    limiter: Option<RateLimiter>,
    block_batch_size: i64,
    /// Last block fully dispatched
    cursor: i64,
}

impl LivePoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Dispatcher,
        source: Arc<dyn TransactionSource>,
        watermarks: Arc<dyn WatermarkStore>,
        gate: Arc<LiveGate>,
        status: Arc<EngineStatus>,
        limiter: Option<RateLimiter>,
        block_batch_size: i64,
        cursor: i64,
    ) -> Self {
        Self {
            dispatcher,
            source,
            watermarks,
            gate,
            status,
            limiter,
            block_batch_size,
            cursor,
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Dispatch everything up to the latest stored block
    ///
    /// Returns the number of transactions dispatched. Stops early, with the
    /// cursor on the last complete block, when the gate closes or a rewind
    /// is requested.
    pub async fn poll_once(&mut self) -> Result<usize, IngestError> {
        let gate = self.gate.clone();
        let mut dispatched = 0;

        loop {
            let _admitted = match gate.admit().await {
                Some(guard) => guard,
                None => {
                    log::debug!("Live poll skipped, ingestion suspended");
                    return Ok(dispatched);
                }
            };

            if self.status.take_rewind() {
                let watermark = self.watermarks.load_watermark()?;
                log::info!(
                    "⏪ Rewinding live cursor from {} to persisted watermark {}",
                    self.cursor,
                    watermark
                );
                self.cursor = watermark;
                self.dispatcher
                    .dispatch(Event::Rewound { watermark })
                    .await?;
            }

            let latest = match self.source.latest_block_height().await? {
                Some(height) if height > self.cursor => height,
                _ => return Ok(dispatched),
            };

            let up_to = (self.cursor + self.block_batch_size).min(latest);
            let rows = self
                .source
                .fetch_range(&RangeQuery::live(self.cursor, up_to))
                .await?;
            log::debug!(
                "Live page ({}, {}]: {} transaction(s)",
                self.cursor,
                up_to,
                rows.len()
            );

            let mut current_block = None;
            for tx in rows {
                if current_block != Some(tx.block_height) {
                    if let Some(finished) = current_block {
                        self.cursor = finished;
                    }
                    if gate.is_suspended() || self.status.rewind_pending() {
                        log::debug!("Live poll paused at block {}", self.cursor);
                        return Ok(dispatched);
                    }
                    current_block = Some(tx.block_height);
                }
                if let Some(limiter) = self.limiter.as_mut() {
                    limiter.acquire().await;
                }
                self.dispatcher.dispatch(Event::Transaction(tx)).await?;
                dispatched += 1;
            }
            self.cursor = up_to;
        }
    }

    pub async fn run(mut self, period: Duration) {
        log::info!(
            "📡 Live poller started at block {} (every {}ms)",
            self.cursor,
            period.as_millis()
        );
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => log::info!("📥 Dispatched {} live transaction(s), cursor {}", n, self.cursor),
                Err(IngestError::Dispatch(_)) => {
                    log::info!("Live poller stopping (dispatcher closed)");
                    return;
                }
                Err(e) => log::error!("❌ Live poll failed: {}", e),
            }
        }
    }
}

/// Emit a `Tick` stamped with the wall-clock date id every `period`
///
/// Ticks are not produced while a resync runs.
pub async fn run_tick_producer(
    dispatcher: Dispatcher,
    gate: Arc<LiveGate>,
    status: Arc<EngineStatus>,
    period: Duration,
) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        timer.tick().await;
        if gate.is_suspended() || status.is_resyncing() {
            continue;
        }
        let event = Event::Tick {
            epoch: current_date_id(),
        };
        if dispatcher.dispatch(event).await.is_err() {
            log::info!("Tick producer stopping (dispatcher closed)");
            return;
        }
    }
}
