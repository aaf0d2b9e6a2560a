//! Snapshot sink: hand-off from the consumer thread to the writer task
//!
//! The consumer never waits on persistence. Snapshots, totals and resync
//! acknowledgments go through one unbounded FIFO channel, and the writer
//! drains it in order, so an acknowledgment is released only after every
//! snapshot queued before it has been written. Rewind requests after a
//! failure travel the same way: the live poller reloads the persisted
//! watermark only once the writes queued before the failure have settled.

use super::context::EngineStatus;
use super::db::SnapshotWriter;
use super::dispatcher::WeakDispatcher;
use super::events::{Ack, Event};
use super::snapshot::{AggregateSnapshot, TotalAggregationSnapshot};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Consumer-side sink interface
pub trait SnapshotSink: Send {
    fn sink_snapshot(&mut self, snapshot: AggregateSnapshot);
    fn sink_totals(&mut self, snapshot: TotalAggregationSnapshot);

    /// Deliver `ack` once everything sunk before it is durable
    fn forward_ack(&mut self, ack: Ack);

    /// Raise the rewind flag once everything sunk before it is settled
    fn request_rewind(&mut self, status: Arc<EngineStatus>);
}

#[derive(Debug)]
pub enum SinkCommand {
    Snapshot(AggregateSnapshot),
    Totals(TotalAggregationSnapshot),
    Ack(Ack),
    Rewind(Arc<EngineStatus>),
}

/// Sink feeding `run_snapshot_writer`
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

pub fn channel_sink() -> (ChannelSink, mpsc::UnboundedReceiver<SinkCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}

impl ChannelSink {
    fn send(&self, command: SinkCommand) {
        if self.tx.send(command).is_err() {
            log::error!("❌ Snapshot writer is gone, dropping sink command");
        }
    }
}

impl SnapshotSink for ChannelSink {
    fn sink_snapshot(&mut self, snapshot: AggregateSnapshot) {
        self.send(SinkCommand::Snapshot(snapshot));
    }

    fn sink_totals(&mut self, snapshot: TotalAggregationSnapshot) {
        self.send(SinkCommand::Totals(snapshot));
    }

    fn forward_ack(&mut self, ack: Ack) {
        self.send(SinkCommand::Ack(ack));
    }

    fn request_rewind(&mut self, status: Arc<EngineStatus>) {
        self.send(SinkCommand::Rewind(status));
    }
}

/// Writer task
///
/// After a snapshot is durable its keys are dispatched back to the engine
/// as `StagingKeysEvicted`. A failed write is logged and its keys stay
/// staged; the persisted watermark does not move, so a restart re-derives
/// the lost epoch. Runs until the engine drops its sink.
pub async fn run_snapshot_writer(
    mut rx: mpsc::UnboundedReceiver<SinkCommand>,
    writer: Arc<dyn SnapshotWriter>,
    evictions: WeakDispatcher,
) {
    log::info!("💾 Snapshot writer started");

    while let Some(command) = rx.recv().await {
        match command {
            SinkCommand::Snapshot(snapshot) => {
                let started = std::time::Instant::now();
                match writer.write_snapshot(&snapshot).await {
                    Ok(()) => {
                        log::info!(
                            "✅ Wrote snapshot #{} for epoch {} ({} rows, block {}{})",
                            snapshot.sequence,
                            snapshot.epoch,
                            snapshot.rows.len(),
                            snapshot.last_block_height,
                            if snapshot.is_resync() { ", resync" } else { "" }
                        );
                        log::debug!("   └─ took {:?}", started.elapsed());
                        if !snapshot.keys.is_empty() {
                            let event = Event::StagingKeysEvicted {
                                sequence: snapshot.sequence,
                                keys: snapshot.keys,
                            };
                            if evictions.dispatch(event).await.is_err() {
                                log::debug!("Consumer gone, staging eviction skipped");
                            }
                        }
                    }
                    Err(e) => {
                        log::error!(
                            "❌ Failed to write snapshot #{} for epoch {}: {}",
                            snapshot.sequence,
                            snapshot.epoch,
                            e
                        );
                    }
                }
            }
            SinkCommand::Totals(totals) => {
                if let Err(e) = writer.write_totals(&totals).await {
                    log::error!("❌ Failed to write totals snapshot: {}", e);
                } else {
                    log::debug!("Wrote {} lifetime rows", totals.rows.len());
                }
            }
            SinkCommand::Ack(ack) => {
                if ack.send(()).is_err() {
                    log::warn!("⚠️  Resync acknowledgment no longer awaited");
                }
            }
            SinkCommand::Rewind(status) => {
                log::info!("⏪ Pending writes settled, asking live poller to rewind");
                status.request_rewind();
            }
        }
    }

    log::info!("✅ Snapshot writer stopped");
}
