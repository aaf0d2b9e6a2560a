use super::entity::Aggregate;
use super::keys::AggregateKey;
use std::collections::HashMap;

/// Aggregates flushed at epoch rollover, held until their rows are durable
///
/// Entries leave only by explicit acknowledgment (`evict`), by reuse in
/// the next epoch (`take`), or by a purge. Each entry remembers the
/// sequence number of the snapshot that staged it, so a late acknowledgment
/// never releases an entry a newer snapshot staged again.
#[derive(Debug, Default)]
pub struct StagingArea {
    entries: HashMap<AggregateKey, (u64, Aggregate)>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(8192),
        }
    }

    pub fn insert(&mut self, key: AggregateKey, sequence: u64, aggregate: Aggregate) {
        self.entries.insert(key, (sequence, aggregate));
    }

    pub fn take(&mut self, key: &AggregateKey) -> Option<Aggregate> {
        self.entries.remove(key).map(|(_, aggregate)| aggregate)
    }

    /// Release keys acknowledged for snapshot `sequence`
    ///
    /// Returns the released entries; keys already taken or staged again by a
    /// later snapshot are left alone.
    pub fn evict(&mut self, sequence: u64, keys: &[AggregateKey]) -> Vec<(AggregateKey, Aggregate)> {
        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            if matches!(self.entries.get(key), Some((staged, _)) if *staged == sequence) {
                if let Some((key, (_, aggregate))) = self.entries.remove_entry(key) {
                    released.push((key, aggregate));
                }
            }
        }
        released
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
