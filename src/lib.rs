pub mod capability;
pub mod commit;
pub mod config;
pub mod demo;
pub mod error;
pub mod executor;
pub mod gas;
pub mod iterator;
pub mod ledger;
pub mod mvmemory;
pub mod scheduler;
pub mod store;
pub mod tracking;
pub mod types;
pub mod validation;
pub mod version_indexed;

pub use config::SchedulerConfig;
pub use error::{EngineFault, ExecError, StoreError};
pub use mvmemory::MVMemory;
pub use scheduler::Scheduler;
pub use store::{MemStore, MultiStore};
pub use types::{TxResult, VM};
pub use version_indexed::{StoreView, TxContext};
