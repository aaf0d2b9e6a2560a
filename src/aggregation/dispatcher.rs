//! Bounded FIFO event queue with a single consumer thread
//!
//! Any number of producers enqueue through cloned `Dispatcher` handles.
//! Enqueue waits while the queue is full. One OS thread drains the queue in
//! arrival order and owns the engine, so aggregation state needs no locks.

use super::engine::AggregationEngine;
use super::error::DispatchError;
use super::events::Event;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

/// Producer handle
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Event>,
}

/// Handle that does not keep the consumer alive
///
/// Held by components the consumer itself feeds (the snapshot writer), so
/// dropping every producer still shuts the consumer down.
#[derive(Clone)]
pub struct WeakDispatcher {
    tx: mpsc::WeakSender<Event>,
}

impl Dispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue an event, waiting for space when the queue is full
    pub async fn dispatch(&self, event: Event) -> Result<(), DispatchError> {
        self.tx.send(event).await.map_err(|_| DispatchError)
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher {
            tx: self.tx.downgrade(),
        }
    }
}

impl WeakDispatcher {
    pub async fn dispatch(&self, event: Event) -> Result<(), DispatchError> {
        match self.tx.upgrade() {
            Some(tx) => tx.send(event).await.map_err(|_| DispatchError),
            None => Err(DispatchError),
        }
    }
}

/// Start the consumer thread
///
/// Runs until every `Dispatcher` is dropped and the queue is drained, then
/// hands the engine back to the caller.
pub fn spawn_consumer(
    mut rx: mpsc::Receiver<Event>,
    mut engine: AggregationEngine,
) -> std::io::Result<JoinHandle<AggregationEngine>> {
    thread::Builder::new()
        .name("txagg-consumer".to_string())
        .spawn(move || {
            log::info!("🚀 Aggregation consumer started");
            while let Some(event) = rx.blocking_recv() {
                engine.handle(event);
            }
            log::info!("✅ Aggregation consumer stopped (queue closed)");
            engine
        })
}
