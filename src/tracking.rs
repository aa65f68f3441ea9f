use crate::types::{Key, Order, Value};
use std::collections::{BTreeMap, BTreeSet};

/// More than one distinct observation for a key makes the incarnation
/// invalid.
pub type ReadSet = BTreeMap<Key, Vec<Option<Value>>>;

pub type WriteSet = BTreeMap<Key, Option<Value>>;

/// What one range iteration actually visited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationTracker {
    pub start: Option<Key>,
    pub end: Option<Key>,
    pub order: Order,
    pub limit: Option<usize>,
    pub iterated_keys: BTreeSet<Key>,
    /// First key the iterator was positioned on but did not yield.
    pub early_stop_key: Option<Key>,
    /// The transaction's own writes inside the range when the iterator was
    /// opened; validation replays against the same view.
    pub writeset: WriteSet,
}

impl IterationTracker {
    pub fn new(start: Option<&[u8]>, end: Option<&[u8]>, order: Order) -> Self {
        IterationTracker {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            order,
            limit: None,
            iterated_keys: BTreeSet::new(),
            early_stop_key: None,
            writeset: WriteSet::new(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let above_start = self.start.as_deref().map_or(true, |start| key >= start);
        let below_end = self.end.as_deref().map_or(true, |end| key < end);
        above_start && below_end
    }
}

/// Records an observation; identical repeats are collapsed.
pub fn record_read(readset: &mut ReadSet, key: &[u8], value: Option<Value>) {
    let observed = readset.entry(key.to_vec()).or_default();
    if !observed.contains(&value) {
        observed.push(value);
    }
}
