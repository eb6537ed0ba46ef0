//! Per-file histogram accumulation.
//!
//! A [`HistogramBuffer`] lives for exactly one file. Records are folded into
//! in-memory counts and the whole file is turned into one [`WriteBatch`] at
//! the end, so the store sees one round-trip per file instead of one per
//! field per packet.

pub mod batch;

use std::collections::{BTreeMap, BTreeSet};

use crate::field::PacketRecord;
use crate::route::KeyPrefix;
use crate::store::keys;

pub use batch::{WriteBatch, WriteOp};

/// In-memory `full key -> value -> count` map for one file.
#[derive(Debug, Default)]
pub struct HistogramBuffer {
    counts: BTreeMap<String, BTreeMap<String, u64>>,
    days: BTreeSet<String>,
    protocols: BTreeSet<String>,
    origin_links: BTreeMap<String, String>,
    records: u64,
}

impl HistogramBuffer {
    /// Creates a new empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds every indexed field of `record` into the counts under `prefix`.
    pub fn record(&mut self, prefix: &KeyPrefix, record: &PacketRecord) {
        let base = prefix.to_string();

        self.days.insert(prefix.day.clone());
        if let Some(protocol) = &prefix.protocol {
            self.protocols.insert(protocol.clone());
        }

        for (field, value) in record.indexed() {
            let key = format!("{base}:{field}");
            *self
                .counts
                .entry(key)
                .or_default()
                .entry(value.to_string())
                .or_insert(0) += 1;
        }

        self.records += 1;
    }

    /// Remembers that `origin_key` resolves to `global_id`. Written in the
    /// same batch as the counts.
    pub fn link_origin(&mut self, origin_key: String, global_id: i64) {
        self.origin_links.insert(origin_key, global_id.to_string());
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of distinct `(key, value)` pairs.
    pub fn distinct_entries(&self) -> usize {
        self.counts.values().map(BTreeMap::len).sum()
    }

    /// Count accumulated for one full key and value.
    pub fn count(&self, key: &str, value: &str) -> u64 {
        self.counts
            .get(key)
            .and_then(|values| values.get(value))
            .copied()
            .unwrap_or(0)
    }

    /// Consumes the buffer into the file's write batch.
    pub fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();

        batch.set_add(keys::DAYS, self.days.into_iter().collect());
        batch.set_add(keys::PROTOCOLS, self.protocols.into_iter().collect());

        for (key, values) in self.counts {
            for (value, amount) in values {
                batch.increment_by(key.clone(), value, amount);
            }
        }

        for (key, id) in self.origin_links {
            batch.set_value(key, id);
        }

        batch
    }
}
