//! Events serialized through the dispatcher into the engine

use super::keys::AggregateKey;
use super::resync::ReSync;
use super::types::TransactionInfo;
use tokio::sync::oneshot;

/// Acknowledgment half of a resync rendezvous
pub type Ack = oneshot::Sender<()>;

#[derive(Debug)]
pub enum Event {
    Transaction(TransactionInfo),

    /// Rows of snapshot `sequence` are durable for these keys
    StagingKeysEvicted {
        sequence: u64,
        keys: Vec<AggregateKey>,
    },

    /// Periodic lifetime totals flush, stamped with the wall-clock date id
    Tick { epoch: i32 },

    ResyncBegin { resync: ReSync, ack: Ack },
    ResyncEnd { resync: ReSync, ack: Ack },

    /// The coordinator gave up waiting for the Begin acknowledgment
    ResyncCancel { resync: ReSync },

    /// The live poller restarted from the persisted watermark; every
    /// transaction after this marker derives from durable state
    Rewound { watermark: i64 },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Transaction(_) => "transaction",
            Event::StagingKeysEvicted { .. } => "staging_keys_evicted",
            Event::Tick { .. } => "tick",
            Event::ResyncBegin { .. } => "resync_begin",
            Event::ResyncEnd { .. } => "resync_end",
            Event::ResyncCancel { .. } => "resync_cancel",
            Event::Rewound { .. } => "rewound",
        }
    }
}
