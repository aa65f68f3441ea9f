use crate::error::{EngineFault, StoreError};
use crate::types::{CommitStore, Key, KvStore, Order, ParentStore, Value};
use std::collections::btree_map::Range;
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemStore {
    data: BTreeMap<Key, Value>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<Key, Value> {
        &self.data
    }

    fn bounded(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Range<'_, Key, Value> {
        let empty: &[u8] = &[];
        let (lower, upper) = match (start, end) {
            // BTreeMap::range rejects inverted bounds
            (Some(start), Some(end)) if start >= end => {
                (Bound::Included(empty), Bound::Excluded(empty))
            }
            _ => (
                start.map_or(Bound::Unbounded, Bound::Included),
                end.map_or(Bound::Unbounded, Bound::Excluded),
            ),
        };
        self.data.range::<[u8], _>((lower, upper))
    }
}

impl FromIterator<(Key, Value)> for MemStore {
    fn from_iter<T: IntoIterator<Item = (Key, Value)>>(iter: T) -> Self {
        MemStore {
            data: iter.into_iter().collect(),
        }
    }
}

impl ParentStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Key, Value)> + 'a> {
        Box::new(
            self.bounded(start, end)
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }

    fn reverse_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Key, Value)> + 'a> {
        Box::new(
            self.bounded(start, end)
                .rev()
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }
}

impl CommitStore for MemStore {
    fn write(&mut self, key: Key, value: Option<Value>) {
        match value {
            Some(value) => {
                self.data.insert(key, value);
            }
            None => {
                self.data.remove(&key);
            }
        }
    }
}

/// Direct, unmetered access. Used for genesis-style setup and by tests that
/// drive the side-table keepers without the engine.
impl KvStore for MemStore {
    fn get(&mut self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        Ok(self.data.get(key).cloned())
    }

    fn has(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.data.contains_key(key))
    }

    fn set(&mut self, key: &[u8], value: Value) -> Result<(), StoreError> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.data.remove(key);
        Ok(())
    }

    fn range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(Key, Value)>, StoreError> {
        let limit = limit.unwrap_or(usize::MAX);
        let items = match order {
            Order::Ascending => self.iterator(start, end).take(limit).collect(),
            Order::Descending => self.reverse_iterator(start, end).take(limit).collect(),
        };
        Ok(items)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MultiStore<S> {
    stores: Vec<(String, S)>,
}

impl<S: CommitStore> MultiStore<S> {
    pub fn new() -> Self {
        MultiStore { stores: Vec::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, store: S) -> Result<(), EngineFault> {
        let name = name.into();
        if self.position(&name).is_some() {
            return Err(EngineFault::Config(format!(
                "store {name} registered twice"
            )));
        }
        self.stores.push((name, store));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stores.iter().position(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&S> {
        self.stores.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut S> {
        self.stores
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    pub fn at(&self, position: usize) -> &S {
        &self.stores[position].1
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut S)> {
        self.stores.iter_mut().map(|(name, s)| (name.as_str(), s))
    }
}
