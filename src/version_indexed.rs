use crate::error::{ExecError, StoreError};
use crate::gas::{GasConfig, GasMeter};
use crate::iterator::{overlay_for, MergeIter};
use crate::tracking::{record_read, IterationTracker, ReadSet, WriteSet};
use crate::types::{Incarnation, Key, KvStore, MVMemory, Order, ParentStore, TxIndex, Value, Version};

// Owned by one worker for one incarnation. Writes stay private until the
// executor publishes them.
pub struct VersionIndexedStore<'a> {
    version: Version,
    mv: &'a dyn MVMemory,
    parent: &'a dyn ParentStore,
    readset: ReadSet,
    writeset: WriteSet,
    iterateset: Vec<IterationTracker>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Recorded {
    pub readset: ReadSet,
    pub writeset: WriteSet,
    pub iterateset: Vec<IterationTracker>,
}

impl<'a> VersionIndexedStore<'a> {
    pub fn new(version: Version, mv: &'a dyn MVMemory, parent: &'a dyn ParentStore) -> Self {
        VersionIndexedStore {
            version,
            mv,
            parent,
            readset: ReadSet::new(),
            writeset: WriteSet::new(),
            iterateset: Vec::new(),
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        if let Some(value) = self.writeset.get(key) {
            return Ok(value.clone());
        }
        let value = match self.mv.get_latest_before_index(key, self.version.index) {
            Some(latest) if latest.is_estimate => {
                return Err(StoreError::Estimate {
                    blocking: latest.tx_index,
                })
            }
            Some(latest) => latest.value,
            None => self.parent.get(key),
        };
        record_read(&mut self.readset, key, value.clone());
        Ok(value)
    }

    /// `None` deletes.
    pub fn write(&mut self, key: &[u8], value: Option<Value>) {
        self.writeset.insert(key.to_vec(), value);
    }

    /// Walks the merged view of `[start, end)` and returns up to `limit` live
    /// entries. `charge` is invoked once per yielded entry before it is
    /// recorded, so a step that runs out of gas is never observed.
    pub fn range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
        limit: Option<usize>,
        mut charge: impl FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<Vec<(Key, Value)>, StoreError> {
        let mut tracker = IterationTracker::new(start, end, order);
        tracker.limit = limit;
        tracker.writeset = self
            .writeset
            .iter()
            .filter(|(key, _)| tracker.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let overlay = overlay_for(self.mv, self.version.index, start, end, &self.writeset);
        let parent = self.parent;
        let limit = limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        for item in MergeIter::new(parent, overlay, start, end, order) {
            if items.len() == limit {
                let next = match item {
                    Ok((key, _)) | Err((key, _)) => key,
                };
                tracker.early_stop_key = Some(next);
                break;
            }
            let (key, value) = item.map_err(|(_, blocking)| StoreError::Estimate { blocking })?;
            if let Err(err) = charge(&key, &value) {
                self.iterateset.push(tracker);
                return Err(err);
            }
            if !self.writeset.contains_key(&key) {
                record_read(&mut self.readset, &key, Some(value.clone()));
            }
            tracker.iterated_keys.insert(key.clone());
            items.push((key, value));
        }
        self.iterateset.push(tracker);
        Ok(items)
    }

    pub fn into_recorded(self) -> Recorded {
        Recorded {
            readset: self.readset,
            writeset: self.writeset,
            iterateset: self.iterateset,
        }
    }
}

pub struct TxContext<'a> {
    version: Version,
    gas: &'a GasConfig,
    meter: GasMeter,
    stores: Vec<(&'a str, VersionIndexedStore<'a>)>,
    blocked_on: Option<TxIndex>,
}

impl<'a> TxContext<'a> {
    pub fn new(
        version: Version,
        gas: &'a GasConfig,
        gas_limit: u64,
        stores: Vec<(&'a str, VersionIndexedStore<'a>)>,
    ) -> Self {
        TxContext {
            version,
            gas,
            meter: GasMeter::new(gas_limit),
            stores,
            blocked_on: None,
        }
    }

    pub fn tx_index(&self) -> TxIndex {
        self.version.index
    }

    pub fn incarnation(&self) -> Incarnation {
        self.version.incarnation
    }

    pub fn gas_meter(&self) -> &GasMeter {
        &self.meter
    }

    pub fn consume_gas(&mut self, amount: u64, descriptor: &'static str) -> Result<(), StoreError> {
        self.meter.consume(amount, descriptor)
    }

    pub fn store(&mut self, name: &str) -> Result<StoreView<'_, 'a>, ExecError> {
        let TxContext {
            gas,
            meter,
            stores,
            blocked_on,
            ..
        } = self;
        let (_, store) = stores
            .iter_mut()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| ExecError::UnknownStore(name.to_string()))?;
        Ok(StoreView {
            store,
            meter,
            gas: *gas,
            blocked_on,
        })
    }

    /// Lowest transaction whose estimate any access of this incarnation
    /// hit, even if the VM swallowed the error.
    pub fn blocked_on(&self) -> Option<TxIndex> {
        self.blocked_on
    }

    pub fn into_parts(self) -> (GasMeter, Vec<Recorded>) {
        let recorded = self
            .stores
            .into_iter()
            .map(|(_, store)| store.into_recorded())
            .collect();
        (self.meter, recorded)
    }
}

pub struct StoreView<'c, 'a> {
    store: &'c mut VersionIndexedStore<'a>,
    meter: &'c mut GasMeter,
    gas: &'c GasConfig,
    blocked_on: &'c mut Option<TxIndex>,
}

impl StoreView<'_, '_> {
    fn note<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(StoreError::Estimate { blocking }) = &result {
            let blocking = *blocking;
            *self.blocked_on = Some(self.blocked_on.map_or(blocking, |b| b.min(blocking)));
        }
        result
    }
}

impl KvStore for StoreView<'_, '_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        self.meter.consume(self.gas.read_cost_flat, "ReadFlat")?;
        let value = self.store.get(key);
        let value = self.note(value)?;
        let bytes = key.len() + value.as_ref().map_or(0, Vec::len);
        self.meter
            .consume(self.gas.read_cost_per_byte * bytes as u64, "ReadPerByte")?;
        Ok(value)
    }

    fn has(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        self.meter.consume(self.gas.has_cost, "Has")?;
        let value = self.store.get(key);
        Ok(self.note(value)?.is_some())
    }

    fn set(&mut self, key: &[u8], value: Value) -> Result<(), StoreError> {
        self.meter.consume(self.gas.write_cost_flat, "WriteFlat")?;
        let bytes = (key.len() + value.len()) as u64;
        self.meter
            .consume(self.gas.write_cost_per_byte * bytes, "WritePerByte")?;
        self.store.write(key, Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.meter.consume(self.gas.delete_cost, "Delete")?;
        self.store.write(key, None);
        Ok(())
    }

    fn range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(Key, Value)>, StoreError> {
        let (meter, gas) = (&mut *self.meter, self.gas);
        let items = self.store.range(start, end, order, limit, |key, value| {
            meter.consume(gas.iter_next_cost_flat, "IterNextFlat")?;
            let bytes = (key.len() + value.len()) as u64;
            meter.consume(gas.iter_next_cost_per_byte * bytes, "IterNextPerByte")
        });
        self.note(items)
    }
}
