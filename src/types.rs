use crate::config::SchedulerConfig;
use crate::error::{EngineFault, ExecError, StoreError};
use crate::executor::TaskOutcome;
use crate::gas::{GasConfig, GasMeter};
use crate::store::MultiStore;
use crate::tracking::{IterationTracker, ReadSet, WriteSet};
use crate::validation::Verdict;
use crate::version_indexed::TxContext;
use rayon::ThreadPool;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

pub type TxIndex = usize;
pub type Incarnation = usize;
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

pub const CODE_OK: u32 = 0;
pub const CODE_INTERNAL: u32 = 1;
pub const CODE_OUT_OF_GAS: u32 = 11;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub index: TxIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(index: TxIndex, incarnation: Incarnation) -> Self {
        Version { index, incarnation }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(tx={}, inc={})", self.index, self.incarnation)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    pub key: Key,
    pub tx_index: TxIndex,
    pub incarnation: Incarnation,
    pub value: Option<Value>,
    pub is_estimate: bool,
    pub is_deleted: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[default]
    Pending,
    Executing,
    Executed,
    Validated,
    Aborted,
    Waiting,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Executing => "executing",
            TaskStatus::Executed => "executed",
            TaskStatus::Validated => "validated",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Waiting => "waiting",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Event {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxResult {
    pub code: u32,
    pub log: String,
    pub events: Vec<Event>,
    pub gas_wanted: u64,
    pub gas_used: u64,
}

impl TxResult {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

pub trait ParentStore: Sync {
    fn get(&self, key: &[u8]) -> Option<Value>;
    /// Ascending over `[start, end)`; `None` bounds are open.
    fn iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Key, Value)> + 'a>;
    /// Descending over `[start, end)`.
    fn reverse_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Key, Value)> + 'a>;
}

pub trait CommitStore: ParentStore {
    /// `None` deletes the key.
    fn write(&mut self, key: Key, value: Option<Value>);
}

pub trait KvStore {
    fn get(&mut self, key: &[u8]) -> Result<Option<Value>, StoreError>;
    fn has(&mut self, key: &[u8]) -> Result<bool, StoreError>;
    fn set(&mut self, key: &[u8], value: Value) -> Result<(), StoreError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;
    /// Visits at most `limit` live entries of `[start, end)` in `order`.
    fn range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(Key, Value)>, StoreError>;
}

pub trait VM: Sync {
    type Tx: Sync;

    fn gas_limit(&self, tx: &Self::Tx) -> u64;
    fn execute(&self, tx: &Self::Tx, ctx: &mut TxContext<'_>) -> Result<Vec<Event>, ExecError>;
}

pub trait Executor {
    fn run(
        &self,
        pool: &ThreadPool,
        versions: &[Version],
        deadline: Option<Instant>,
    ) -> Result<Vec<Option<TaskOutcome>>, EngineFault>;
    fn execute_task(&self, version: Version) -> Result<TaskOutcome, EngineFault>;
}

pub trait MVMemory: Sync {
    fn new(name: &str, block_size: usize) -> Self
    where
        Self: Sized;
    fn name(&self) -> &str;
    fn set_writeset(&self, version: Version, ws: WriteSet) -> bool;
    fn invalidate_writeset(&self, tx_index: TxIndex, incarnation: Incarnation);
    fn set_estimated_writeset(&self, version: Version, ws: WriteSet);
    fn remove_writeset(&self, tx_index: TxIndex);
    fn writeset_keys(&self, tx_index: TxIndex) -> Vec<Key>;
    fn get_latest_before_index(&self, key: &[u8], before: TxIndex) -> Option<VersionedValue>;
    fn collect_iterator_items(
        &self,
        before: TxIndex,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> BTreeMap<Key, VersionedValue>;
    fn set_readset(&self, tx_index: TxIndex, readset: ReadSet);
    fn get_readset(&self, tx_index: TxIndex) -> ReadSet;
    fn set_iterateset(&self, tx_index: TxIndex, iterateset: Vec<IterationTracker>);
    fn get_iterateset(&self, tx_index: TxIndex) -> Vec<IterationTracker>;
    fn validate_transaction_state(
        &self,
        parent: &dyn ParentStore,
        tx_index: TxIndex,
        gas: &GasConfig,
        meter: &mut GasMeter,
    ) -> Verdict;
    fn first_estimate(&self) -> Option<TxIndex>;
    fn write_latest_to_store(&self, parent: &mut dyn CommitStore) -> Result<usize, EngineFault>;
}

pub trait Scheduler: Sync {
    fn new(config: SchedulerConfig) -> Result<Self, EngineFault>
    where
        Self: Sized;
    fn process_all<V: VM, S: CommitStore>(
        &self,
        vm: &V,
        txs: &[V::Tx],
        multistore: &mut MultiStore<S>,
    ) -> Result<Vec<TxResult>, EngineFault>;
}

/// Returns the exclusive upper bound of all keys starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Key> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
