use crate::error::{EngineFault, ExecError, StoreError};
use crate::gas::GasConfig;
use crate::tracking::WriteSet;
use crate::types::{self, MVMemory, ParentStore, TxIndex, TxResult, Version, CODE_OK, VM};
use crate::version_indexed::{TxContext, VersionIndexedStore};

use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, debug_span, trace};

pub struct StoreHandle<'s, M> {
    pub name: &'s str,
    pub mv: &'s M,
    pub parent: &'s dyn ParentStore,
}

impl<M> Clone for StoreHandle<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for StoreHandle<'_, M> {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    /// Ran to completion; the response may still be a failure.
    Executed,
    /// Read an estimate of `blocking`; the partial writeset was published as
    /// estimates.
    Aborted { blocking: TxIndex },
    /// The handler panicked; only the reads were published.
    Panicked { message: String },
}

#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub version: Version,
    pub status: ExecStatus,
    pub response: Option<TxResult>,
    pub validation_budget: u64,
}

type Slot = Mutex<Option<Result<TaskOutcome, EngineFault>>>;

pub struct Executor<'s, V: VM, M: MVMemory> {
    concurrency: usize,
    vm: &'s V,
    txs: &'s [V::Tx],
    stores: Vec<StoreHandle<'s, M>>,
    gas: &'s GasConfig,
}

impl<'s, V: VM, M: MVMemory> Executor<'s, V, M> {
    pub fn new(
        concurrency: usize,
        vm: &'s V,
        txs: &'s [V::Tx],
        stores: Vec<StoreHandle<'s, M>>,
        gas: &'s GasConfig,
    ) -> Self {
        Executor {
            concurrency,
            vm,
            txs,
            stores,
            gas,
        }
    }

    fn run_inner(
        &self,
        worker: usize,
        cursor: &AtomicUsize,
        versions: &[Version],
        slots: &[Slot],
        deadline: Option<Instant>,
    ) {
        let _span = debug_span!("worker", worker).entered();
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("deadline passed, worker stops pulling");
                break;
            }
            let next = cursor.fetch_add(1, Ordering::AcqRel);
            let Some(version) = versions.get(next) else {
                break;
            };
            let outcome = types::Executor::execute_task(self, *version);
            *slots[next].lock() = Some(outcome);
        }
    }
}

impl<V: VM, M: MVMemory> types::Executor for Executor<'_, V, M> {
    fn run(
        &self,
        pool: &ThreadPool,
        versions: &[Version],
        deadline: Option<Instant>,
    ) -> Result<Vec<Option<TaskOutcome>>, EngineFault> {
        let cursor = AtomicUsize::new(0);
        let slots: Vec<Slot> = versions.iter().map(|_| Mutex::new(None)).collect();
        let workers = self.concurrency.min(versions.len());

        pool.install(|| {
            (0..workers)
                .into_par_iter()
                .for_each(|worker| self.run_inner(worker, &cursor, versions, &slots, deadline))
        });

        let mut outcomes = Vec::with_capacity(versions.len());
        for slot in slots {
            match slot.into_inner() {
                Some(Ok(outcome)) => outcomes.push(Some(outcome)),
                Some(Err(fault)) => return Err(fault),
                None => outcomes.push(None),
            }
        }
        Ok(outcomes)
    }

    fn execute_task(&self, version: Version) -> Result<TaskOutcome, EngineFault> {
        let index = version.index;
        let tx = &self.txs[index];
        let gas_limit = self.vm.gas_limit(tx);
        let overlays = self
            .stores
            .iter()
            .map(|h| (h.name, VersionIndexedStore::new(version, h.mv, h.parent)))
            .collect();
        let mut ctx = TxContext::new(version, self.gas, gas_limit, overlays);

        let (result, panicked) = match panic::catch_unwind(AssertUnwindSafe(|| self.vm.execute(tx, &mut ctx))) {
            Ok(result) => (result, None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                (Err(ExecError::app(types::CODE_INTERNAL, message.clone())), Some(message))
            }
        };

        let blocked_on = ctx.blocked_on().or(match &result {
            Err(ExecError::Store(StoreError::Estimate { blocking })) => Some(*blocking),
            _ => None,
        });
        let (mut meter, recorded) = ctx.into_parts();

        if let Some(blocking) = blocked_on {
            trace!(tx_index = index, incarnation = version.incarnation, blocking, "aborted on estimate");
            for (handle, recorded) in self.stores.iter().zip(recorded) {
                handle.mv.set_estimated_writeset(version, recorded.writeset);
            }
            return Ok(TaskOutcome {
                version,
                status: ExecStatus::Aborted { blocking },
                response: None,
                validation_budget: 0,
            });
        }

        let validation_budget = recorded
            .iter()
            .map(|r| self.gas.replay_cost(&r.readset, &r.iterateset))
            .fold(0u64, u64::saturating_add);

        if let Some(message) = panicked {
            debug!(tx_index = index, incarnation = version.incarnation, %message, "handler panicked");
            for (handle, recorded) in self.stores.iter().zip(recorded) {
                handle.mv.set_readset(index, recorded.readset);
                handle.mv.set_iterateset(index, recorded.iterateset);
                handle.mv.set_writeset(version, WriteSet::new());
            }
            return Ok(TaskOutcome {
                version,
                status: ExecStatus::Panicked { message },
                response: None,
                validation_budget,
            });
        }

        let reserved = meter.consume(validation_budget, "ValidationReplay");
        let outcome = match (result, reserved) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(ExecError::from(err)),
            (Ok(events), Ok(())) => Ok(events),
        };

        let mut response = TxResult {
            gas_wanted: gas_limit,
            gas_used: meter.consumed(),
            ..Default::default()
        };
        for (handle, recorded) in self.stores.iter().zip(recorded) {
            handle.mv.set_readset(index, recorded.readset);
            handle.mv.set_iterateset(index, recorded.iterateset);
            let writeset = if outcome.is_ok() {
                recorded.writeset
            } else {
                WriteSet::new()
            };
            handle.mv.set_writeset(version, writeset);
        }
        match outcome {
            Ok(events) => {
                response.code = CODE_OK;
                response.events = events;
            }
            Err(err) => {
                debug!(tx_index = index, incarnation = version.incarnation, %err, "transaction failed");
                response.code = err.code();
                response.log = err.to_string();
            }
        }
        Ok(TaskOutcome {
            version,
            status: ExecStatus::Executed,
            response: Some(response),
            validation_budget,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
