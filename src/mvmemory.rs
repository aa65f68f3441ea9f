use crate::error::EngineFault;
use crate::gas::{GasConfig, GasMeter};
use crate::tracking::{IterationTracker, ReadSet, WriteSet};
use crate::types::{self, CommitStore, Incarnation, Key, ParentStore, TxIndex, Value, Version, VersionedValue};
use crate::validation::{self, Verdict};

use parking_lot::RwLock;
use std::collections::btree_map::Entry::{Occupied, Vacant};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use tracing::debug;

// Cells and the per-transaction writeset index share one lock, so a reader
// sees either the old writeset of a transaction or the new one.
pub struct MVMemory {
    name: String,
    inner: RwLock<Inner>,
    last_readset: Vec<RwLock<ReadSet>>,
    last_iterateset: Vec<RwLock<Vec<IterationTracker>>>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<Key, BTreeMap<TxIndex, DataCell>>,
    last_writeset: Vec<BTreeSet<Key>>,
}

struct DataCell {
    flag: Flag,
    incarnation: Incarnation,
    value: Option<Value>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flag {
    Done,
    Estimate,
}

impl DataCell {
    fn to_versioned(&self, key: &[u8], tx_index: TxIndex) -> VersionedValue {
        VersionedValue {
            key: key.to_vec(),
            tx_index,
            incarnation: self.incarnation,
            value: self.value.clone(),
            is_estimate: self.flag == Flag::Estimate,
            is_deleted: self.flag == Flag::Done && self.value.is_none(),
        }
    }
}

impl Inner {
    fn write_cell(&mut self, key: Key, version: Version, flag: Flag, value: Option<Value>) {
        let cells = self.data.entry(key.clone()).or_default();
        match cells.entry(version.index) {
            Occupied(o) => {
                let o = o.into_mut();
                debug_assert!(
                    o.incarnation <= version.incarnation,
                    "existing transaction value does not have lower incarnation: {:?}, {}",
                    key,
                    version
                );
                o.flag = flag;
                o.incarnation = version.incarnation;
                o.value = value;
            }
            Vacant(vacant) => {
                vacant.insert(DataCell {
                    flag,
                    incarnation: version.incarnation,
                    value,
                });
            }
        }
        self.last_writeset[version.index].insert(key);
    }

    fn remove_cell(&mut self, key: &[u8], tx_index: TxIndex) {
        if let Some(cells) = self.data.get_mut(key) {
            cells.remove(&tx_index);
            if cells.is_empty() {
                self.data.remove(key);
            }
        }
    }

    fn remove_writeset(&mut self, tx_index: TxIndex) -> BTreeSet<Key> {
        let prev = std::mem::take(&mut self.last_writeset[tx_index]);
        for key in &prev {
            self.remove_cell(key, tx_index);
        }
        prev
    }

    fn latest_before(&self, key: &[u8], before: TxIndex) -> Option<VersionedValue> {
        let cells = self.data.get(key)?;
        let (tx_index, cell) = cells.range(..before).next_back()?;
        Some(cell.to_versioned(key, *tx_index))
    }
}

impl MVMemory {
    /// Records a single speculative write. Only the worker currently owning
    /// `tx_index` may call this.
    pub fn set(&self, key: Key, tx_index: TxIndex, incarnation: Incarnation, value: Option<Value>) {
        self.inner
            .write()
            .write_cell(key, Version::new(tx_index, incarnation), Flag::Done, value);
    }

    pub fn get_latest(&self, key: &[u8]) -> Option<VersionedValue> {
        self.inner.read().latest_before(key, usize::MAX)
    }

    pub fn snapshot(&self) -> Vec<(Key, Option<Value>)> {
        let inner = self.inner.read();
        inner
            .data
            .iter()
            .filter_map(|(key, cells)| {
                let (_, cell) = cells.iter().next_back()?;
                Some((key.clone(), cell.value.clone()))
            })
            .collect()
    }
}

impl types::MVMemory for MVMemory {
    fn new(name: &str, block_size: usize) -> Self {
        MVMemory {
            name: name.to_string(),
            inner: RwLock::new(Inner {
                data: BTreeMap::new(),
                last_writeset: (0..block_size).map(|_| BTreeSet::new()).collect(),
            }),
            last_readset: (0..block_size).map(|_| RwLock::default()).collect(),
            last_iterateset: (0..block_size).map(|_| RwLock::default()).collect(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    // returns whether a key outside the previous writeset was written
    fn set_writeset(&self, version: Version, ws: WriteSet) -> bool {
        let mut inner = self.inner.write();
        let prev = std::mem::take(&mut inner.last_writeset[version.index]);
        let wrote_new_location = ws.keys().any(|key| !prev.contains(key));
        for key in prev.iter().filter(|key| !ws.contains_key(*key)) {
            inner.remove_cell(key, version.index);
        }
        for (key, value) in ws {
            inner.write_cell(key, version, Flag::Done, value);
        }
        wrote_new_location
    }

    fn invalidate_writeset(&self, tx_index: TxIndex, incarnation: Incarnation) {
        let mut inner = self.inner.write();
        let keys: Vec<Key> = inner.last_writeset[tx_index].iter().cloned().collect();
        for key in keys {
            if let Some(cell) = inner
                .data
                .get_mut(&key)
                .and_then(|cells| cells.get_mut(&tx_index))
            {
                debug_assert!(cell.incarnation <= incarnation);
                cell.flag = Flag::Estimate;
            }
        }
    }

    fn set_estimated_writeset(&self, version: Version, ws: WriteSet) {
        let mut inner = self.inner.write();
        inner.remove_writeset(version.index);
        for (key, value) in ws {
            inner.write_cell(key, version, Flag::Estimate, value);
        }
    }

    fn remove_writeset(&self, tx_index: TxIndex) {
        let removed = self.inner.write().remove_writeset(tx_index);
        debug!(store = %self.name, tx_index, keys = removed.len(), "removed writeset");
    }

    fn writeset_keys(&self, tx_index: TxIndex) -> Vec<Key> {
        self.inner.read().last_writeset[tx_index]
            .iter()
            .cloned()
            .collect()
    }

    fn get_latest_before_index(&self, key: &[u8], before: TxIndex) -> Option<VersionedValue> {
        self.inner.read().latest_before(key, before)
    }

    fn collect_iterator_items(
        &self,
        before: TxIndex,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> BTreeMap<Key, VersionedValue> {
        let inner = self.inner.read();
        let mut items = BTreeMap::new();
        if let (Some(start), Some(end)) = (start, end) {
            if start >= end {
                return items;
            }
        }
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        for (key, cells) in inner.data.range::<[u8], _>((lower, upper)) {
            if let Some((tx_index, cell)) = cells.range(..before).next_back() {
                items.insert(key.clone(), cell.to_versioned(key, *tx_index));
            }
        }
        items
    }

    fn set_readset(&self, tx_index: TxIndex, readset: ReadSet) {
        *self.last_readset[tx_index].write() = readset;
    }

    fn get_readset(&self, tx_index: TxIndex) -> ReadSet {
        self.last_readset[tx_index].read().clone()
    }

    fn set_iterateset(&self, tx_index: TxIndex, iterateset: Vec<IterationTracker>) {
        *self.last_iterateset[tx_index].write() = iterateset;
    }

    fn get_iterateset(&self, tx_index: TxIndex) -> Vec<IterationTracker> {
        self.last_iterateset[tx_index].read().clone()
    }

    fn validate_transaction_state(
        &self,
        parent: &dyn ParentStore,
        tx_index: TxIndex,
        gas: &GasConfig,
        meter: &mut GasMeter,
    ) -> Verdict {
        validation::validate_transaction_state(self, parent, tx_index, gas, meter)
    }

    // writer of the first estimate that would be the latest value of its key
    fn first_estimate(&self) -> Option<TxIndex> {
        let inner = self.inner.read();
        inner.data.values().find_map(|cells| {
            let (tx_index, cell) = cells.iter().next_back()?;
            (cell.flag == Flag::Estimate).then_some(*tx_index)
        })
    }

    /// Applies the highest write of every key to `parent`, in key order, and
    /// returns the number of keys written. An estimate at this point means a
    /// transaction was committed without a final execution.
    fn write_latest_to_store(&self, parent: &mut dyn CommitStore) -> Result<usize, EngineFault> {
        let inner = self.inner.read();
        let mut written = 0;
        for (key, cells) in &inner.data {
            let Some((tx_index, cell)) = cells.iter().next_back() else {
                continue;
            };
            if cell.flag == Flag::Estimate {
                return Err(EngineFault::EstimateAtCommit {
                    store: self.name.clone(),
                    index: *tx_index,
                });
            }
            parent.write(key.clone(), cell.value.clone());
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::types::MVMemory as _;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn ws(entries: &[(&str, Option<&str>)]) -> WriteSet {
        entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.map(|v| v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn read_sees_only_lower_indices() {
        let mv = MVMemory::new("bank", 3);
        mv.set(b"k".to_vec(), 0, 0, Some(b"100".to_vec()));

        let latest = mv.get_latest_before_index(b"k", 1).unwrap();
        assert_eq!(latest.value, Some(b"100".to_vec()));
        assert_eq!(latest.tx_index, 0);

        assert!(mv.get_latest_before_index(b"k", 0).is_none());
    }

    #[test]
    fn read_highest_lower_version() {
        let mv = MVMemory::new("bank", 5);
        mv.set(b"k".to_vec(), 0, 0, Some(b"100".to_vec()));
        mv.set(b"k".to_vec(), 2, 0, Some(b"200".to_vec()));

        assert_eq!(mv.get_latest_before_index(b"k", 4).unwrap().tx_index, 2);
        assert_eq!(mv.get_latest_before_index(b"k", 2).unwrap().tx_index, 0);
        assert_eq!(mv.get_latest(b"k").unwrap().value, Some(b"200".to_vec()));
    }

    #[test]
    fn tombstone_is_reported_as_deleted() {
        let mv = MVMemory::new("bank", 2);
        mv.set(b"k".to_vec(), 0, 0, None);
        let latest = mv.get_latest_before_index(b"k", 1).unwrap();
        assert!(latest.is_deleted);
        assert!(!latest.is_estimate);
    }

    #[test]
    fn set_writeset_replaces_previous_incarnation() {
        let mv = MVMemory::new("bank", 2);
        assert!(mv.set_writeset(Version::new(0, 0), ws(&[("a", Some("1")), ("b", Some("2"))])));
        assert!(!mv.set_writeset(Version::new(0, 1), ws(&[("a", Some("3"))])));

        assert_eq!(mv.get_latest(b"a").unwrap().value, Some(b"3".to_vec()));
        assert_eq!(mv.get_latest(b"a").unwrap().incarnation, 1);
        assert!(mv.get_latest(b"b").is_none());
        assert_eq!(mv.writeset_keys(0), vec![b"a".to_vec()]);

        assert!(mv.set_writeset(Version::new(0, 2), ws(&[("c", Some("4"))])));
    }

    #[test]
    fn invalidate_turns_writes_into_estimates() {
        let mv = MVMemory::new("bank", 2);
        mv.set_writeset(Version::new(0, 0), ws(&[("a", Some("1"))]));
        mv.invalidate_writeset(0, 0);
        let latest = mv.get_latest_before_index(b"a", 1).unwrap();
        assert!(latest.is_estimate);
        assert_eq!(latest.tx_index, 0);
    }

    #[test]
    fn estimated_writeset_drops_old_keys() {
        let mv = MVMemory::new("bank", 2);
        mv.set_writeset(Version::new(0, 0), ws(&[("a", Some("1")), ("b", Some("2"))]));
        mv.set_estimated_writeset(Version::new(0, 1), ws(&[("b", Some("9"))]));
        assert!(mv.get_latest(b"a").is_none());
        assert!(mv.get_latest(b"b").unwrap().is_estimate);
    }

    #[test]
    fn remove_writeset_clears_every_key() {
        let mv = MVMemory::new("bank", 2);
        mv.set_writeset(Version::new(1, 0), ws(&[("a", Some("1")), ("b", None)]));
        mv.remove_writeset(1);
        assert!(mv.get_latest(b"a").is_none());
        assert!(mv.get_latest(b"b").is_none());
        assert!(mv.writeset_keys(1).is_empty());
        assert!(mv.snapshot().is_empty());
    }

    #[test]
    fn collect_iterator_items_respects_range_and_index() {
        let mv = MVMemory::new("bank", 4);
        mv.set_writeset(Version::new(0, 0), ws(&[("a", Some("1")), ("c", Some("3"))]));
        mv.set_writeset(Version::new(2, 0), ws(&[("b", Some("2")), ("c", None)]));

        let items = mv.collect_iterator_items(2, Some(b"a".as_slice()), Some(b"d".as_slice()));
        assert_eq!(items.len(), 2);
        assert_eq!(items[&b"c".to_vec()].value, Some(b"3".to_vec()));

        let items = mv.collect_iterator_items(3, Some(b"b".as_slice()), None);
        assert_eq!(items.len(), 2);
        assert!(items[&b"c".to_vec()].is_deleted);
    }

    #[test]
    fn write_latest_applies_highest_writer_in_key_order() {
        let mv = MVMemory::new("bank", 3);
        mv.set_writeset(Version::new(0, 0), ws(&[("a", Some("1")), ("b", Some("x"))]));
        mv.set_writeset(Version::new(2, 0), ws(&[("a", Some("2")), ("b", None)]));

        let mut parent: MemStore = [(b"b".to_vec(), b"old".to_vec())].into_iter().collect();
        assert_eq!(mv.write_latest_to_store(&mut parent).unwrap(), 2);
        assert_eq!(ParentStore::get(&parent, b"a"), Some(b"2".to_vec()));
        assert_eq!(ParentStore::get(&parent, b"b"), None);
    }

    #[test]
    fn write_latest_refuses_estimates() {
        let mv = MVMemory::new("bank", 1);
        mv.set_writeset(Version::new(0, 0), ws(&[("a", Some("1"))]));
        mv.invalidate_writeset(0, 0);
        let mut parent = MemStore::new();
        assert!(matches!(
            mv.write_latest_to_store(&mut parent),
            Err(EngineFault::EstimateAtCommit { index: 0, .. })
        ));
        assert!(parent.is_empty());
    }

    #[test]
    fn stress_readers_never_see_partial_writesets() {
        // Tx 0 flips between two complete writesets; a reader at index 1 must
        // always see both keys from the same incarnation or neither key.
        let mv = Arc::new(MVMemory::new("bank", 2));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let mv = Arc::clone(&mv);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                for incarnation in 0..2_000 {
                    if incarnation % 3 == 2 {
                        mv.remove_writeset(0);
                    } else {
                        let v = incarnation.to_string();
                        let mut set = WriteSet::new();
                        set.insert(b"x".to_vec(), Some(v.clone().into_bytes()));
                        set.insert(b"y".to_vec(), Some(v.into_bytes()));
                        mv.set_writeset(Version::new(0, incarnation), set);
                    }
                }
                stop.store(true, Ordering::Release);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mv = Arc::clone(&mv);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let items = mv.collect_iterator_items(1, None, None);
                        match (items.get(b"x".as_slice()), items.get(b"y".as_slice())) {
                            (None, None) => {}
                            (Some(x), Some(y)) => {
                                assert_eq!(x.incarnation, y.incarnation);
                                assert_eq!(x.value, y.value);
                            }
                            other => panic!("partial writeset observed: {:?}", other),
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn stress_disjoint_writers() {
        let num_txns = 64;
        let mv = Arc::new(MVMemory::new("bank", num_txns));
        let handles: Vec<_> = (0..num_txns)
            .map(|i| {
                let mv = Arc::clone(&mv);
                thread::spawn(move || {
                    let mut set = WriteSet::new();
                    set.insert(format!("k{i}").into_bytes(), Some(vec![i as u8]));
                    mv.set_writeset(Version::new(i, 0), set);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..num_txns {
            let key = format!("k{i}").into_bytes();
            assert_eq!(mv.get_latest_before_index(&key, i + 1).unwrap().tx_index, i);
            assert!(mv.get_latest_before_index(&key, i).is_none());
        }
    }
}
