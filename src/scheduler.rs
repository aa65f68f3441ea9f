use crate::commit;
use crate::config::SchedulerConfig;
use crate::error::EngineFault;
use crate::executor::{self, ExecStatus, StoreHandle, TaskOutcome};
use crate::gas::GasMeter;
use crate::mvmemory;
use crate::store::MultiStore;
use crate::types::{self, CommitStore, Executor, Incarnation, MVMemory, TaskStatus, TxIndex, TxResult, Version, VM};
use crate::validation::Verdict;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, trace, warn};

#[derive(Clone, Debug, Default)]
pub struct Task {
    pub index: TxIndex,
    pub incarnation: Incarnation,
    pub status: TaskStatus,
    /// Lower transactions that must be validated before this one reruns.
    pub dependencies: BTreeSet<TxIndex>,
    pub response: Option<TxResult>,
    panic: Option<String>,
    validation_budget: u64,
}

impl Task {
    fn new(index: TxIndex) -> Self {
        Task {
            index,
            ..Default::default()
        }
    }

    fn version(&self) -> Version {
        Version::new(self.index, self.incarnation)
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
}

// Verdicts are computed in parallel against a frozen state and applied in
// index order, so every transition is a function of the batch alone.
struct Batch<'s, E, M> {
    executor: E,
    stores: Vec<StoreHandle<'s, M>>,
    tasks: Vec<Task>,
    pool: ThreadPool,
    config: &'s SchedulerConfig,
    deadline: Option<Instant>,
    iteration: usize,
}

impl Scheduler {
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl types::Scheduler for Scheduler {
    fn new(config: SchedulerConfig) -> Result<Self, EngineFault> {
        config.validate()?;
        Ok(Scheduler { config })
    }

    /// Executes `txs` as if one after another in index order and commits
    /// the result into `multistore`. On a fault nothing is committed.
    fn process_all<V: VM, S: CommitStore>(
        &self,
        vm: &V,
        txs: &[V::Tx],
        multistore: &mut MultiStore<S>,
    ) -> Result<Vec<TxResult>, EngineFault> {
        let workers = self.config.resolve_workers(txs.len());
        let _span = info_span!("process_all", txs = txs.len(), workers).entered();
        let started = Instant::now();

        let mvs: Vec<mvmemory::MVMemory> = multistore
            .names()
            .map(|name| mvmemory::MVMemory::new(name, txs.len()))
            .collect();
        let results = {
            let stores: Vec<StoreHandle<'_, mvmemory::MVMemory>> = mvs
                .iter()
                .enumerate()
                .map(|(position, mv)| StoreHandle {
                    name: mv.name(),
                    mv,
                    parent: multistore.at(position),
                })
                .collect();
            let pool = ThreadPoolBuilder::new().num_threads(workers).build()?;
            let mut batch = Batch {
                executor: executor::Executor::new(workers, vm, txs, stores.clone(), &self.config.gas),
                stores,
                tasks: (0..txs.len()).map(Task::new).collect(),
                pool,
                config: &self.config,
                deadline: self
                    .config
                    .deadline_ms
                    .map(|ms| started + Duration::from_millis(ms)),
                iteration: 0,
            };
            batch.run()?;
            batch.pre_commit_check()?;
            batch.into_results()?
        };

        commit::commit_all(&mvs, multistore)?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch committed"
        );
        Ok(results)
    }
}

impl<E: Executor + Sync, M: MVMemory> Batch<'_, E, M> {
    fn run(&mut self) -> Result<(), EngineFault> {
        let mut to_execute: Vec<TxIndex> = (0..self.tasks.len()).collect();
        while !self.all_validated() {
            self.check_deadline()?;
            if self.iteration >= self.config.max_iterations {
                warn!(
                    iteration = self.iteration,
                    "too many iterations, executing the rest sequentially"
                );
                return self.run_sequential();
            }
            self.execute_round(&to_execute)?;
            to_execute = self.validate_all();
            self.check_panics()?;
            self.iteration += 1;
            debug!(
                iteration = self.iteration,
                rerun = to_execute.len(),
                "round validated"
            );
        }
        info!(iterations = self.iteration, "all transactions validated");
        Ok(())
    }

    fn all_validated(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Validated)
    }

    fn first_non_validated(&self) -> Option<TxIndex> {
        self.tasks
            .iter()
            .position(|t| t.status != TaskStatus::Validated)
    }

    fn check_deadline(&self) -> Result<(), EngineFault> {
        match (self.deadline, self.config.deadline_ms) {
            (Some(deadline), Some(deadline_ms)) if Instant::now() >= deadline => {
                warn!(iteration = self.iteration, "batch deadline exceeded");
                Err(EngineFault::DeadlineExceeded {
                    deadline_ms,
                    iterations: self.iteration,
                })
            }
            _ => Ok(()),
        }
    }

    /// A panic is only a fault once its incarnation is validated with every
    /// lower transaction; then a sequential run would hit it too.
    fn check_panics(&self) -> Result<(), EngineFault> {
        for task in &self.tasks {
            if task.status != TaskStatus::Validated {
                break;
            }
            if let Some(message) = &task.panic {
                return Err(EngineFault::WorkerPanic {
                    index: task.index,
                    message: message.clone(),
                });
            }
        }
        Ok(())
    }

    fn execute_round(&mut self, to_execute: &[TxIndex]) -> Result<(), EngineFault> {
        let versions: Vec<Version> = to_execute
            .iter()
            .map(|&index| {
                let task = &mut self.tasks[index];
                task.status = TaskStatus::Executing;
                task.version()
            })
            .collect();
        let outcomes = self.executor.run(&self.pool, &versions, self.deadline)?;
        self.check_deadline()?;
        for (version, outcome) in versions.iter().zip(outcomes) {
            let outcome = outcome.ok_or(EngineFault::MissingResponse {
                index: version.index,
            })?;
            self.apply_outcome(outcome);
        }
        Ok(())
    }

    fn apply_outcome(&mut self, outcome: TaskOutcome) {
        let task = &mut self.tasks[outcome.version.index];
        match outcome.status {
            ExecStatus::Executed => {
                task.status = TaskStatus::Executed;
                task.response = outcome.response;
                task.panic = None;
                task.validation_budget = outcome.validation_budget;
            }
            ExecStatus::Panicked { message } => {
                task.status = TaskStatus::Executed;
                task.response = None;
                task.panic = Some(message);
                task.validation_budget = outcome.validation_budget;
            }
            ExecStatus::Aborted { blocking } => {
                task.status = TaskStatus::Aborted;
                task.dependencies.insert(blocking);
            }
        }
    }

    fn verdict(&self, task: &Task) -> Verdict {
        let mut meter = GasMeter::new(task.validation_budget);
        let mut verdict = Verdict::valid();
        for store in &self.stores {
            verdict.merge(store.mv.validate_transaction_state(
                store.parent,
                task.index,
                &self.config.gas,
                &mut meter,
            ));
        }
        verdict
    }

    fn validate_all(&mut self) -> Vec<TxIndex> {
        let Some(start) = self.first_non_validated() else {
            return Vec::new();
        };
        let verdicts: Vec<Option<Verdict>> = {
            let this = &*self;
            this.pool.install(|| {
                this.tasks[start..]
                    .par_iter()
                    .map(|task| match task.status {
                        TaskStatus::Executed | TaskStatus::Validated => Some(this.verdict(task)),
                        _ => None,
                    })
                    .collect()
            })
        };

        let mut rerun = Vec::new();
        let mut lower_rerun = false;
        for (offset, verdict) in verdicts.into_iter().enumerate() {
            let index = start + offset;
            if self.should_rerun(index, verdict, lower_rerun) {
                self.schedule_rerun(index);
                rerun.push(index);
            }
            if self.tasks[index].status != TaskStatus::Validated {
                lower_rerun |= self.tasks[index].status != TaskStatus::Executed;
            }
        }
        rerun
    }

    fn dependencies_validated(&self, index: TxIndex) -> bool {
        self.tasks[index]
            .dependencies
            .iter()
            .all(|&dep| self.tasks[dep].status == TaskStatus::Validated)
    }

    // A verdict computed while a lower task is being rerun may be stale, so
    // such a task is never promoted to validated in the same pass.
    fn should_rerun(&mut self, index: TxIndex, verdict: Option<Verdict>, lower_rerun: bool) -> bool {
        match self.tasks[index].status {
            TaskStatus::Aborted | TaskStatus::Pending | TaskStatus::Waiting => {
                if self.dependencies_validated(index) {
                    return true;
                }
                self.tasks[index].status = TaskStatus::Waiting;
                false
            }
            TaskStatus::Executed | TaskStatus::Validated => {
                let Some(verdict) = verdict else {
                    return false;
                };
                let task = &mut self.tasks[index];
                if !verdict.valid {
                    trace!(tx_index = index, incarnation = task.incarnation, "validation failed");
                    for store in &self.stores {
                        store.mv.invalidate_writeset(index, task.incarnation);
                    }
                    task.dependencies.extend(verdict.conflicts);
                    if self.dependencies_validated(index) {
                        return true;
                    }
                    self.tasks[index].status = TaskStatus::Waiting;
                    return false;
                }
                if verdict.conflicts.is_empty() && !lower_rerun {
                    task.status = TaskStatus::Validated;
                } else {
                    task.status = TaskStatus::Executed;
                    task.dependencies.extend(verdict.conflicts);
                }
                false
            }
            TaskStatus::Executing => false,
        }
    }

    fn schedule_rerun(&mut self, index: TxIndex) {
        let task = &mut self.tasks[index];
        task.incarnation += 1;
        task.status = TaskStatus::Pending;
        task.dependencies.clear();
        task.response = None;
        task.panic = None;
    }

    /// Re-executes the suffix from the first unvalidated index on the
    /// calling thread. Every lower task is final, so no read can hit an
    /// estimate and no validation is needed.
    fn run_sequential(&mut self) -> Result<(), EngineFault> {
        let Some(start) = self.first_non_validated() else {
            return Ok(());
        };
        for index in start..self.tasks.len() {
            self.check_deadline()?;
            self.schedule_rerun(index);
            let version = self.tasks[index].version();
            let outcome = self.executor.execute_task(version)?;
            match &outcome.status {
                ExecStatus::Aborted { blocking } => {
                    warn!(tx_index = index, blocking, "estimate seen during sequential execution");
                    return Err(EngineFault::NotValidated {
                        index,
                        status: TaskStatus::Aborted,
                    });
                }
                ExecStatus::Panicked { message } => {
                    return Err(EngineFault::WorkerPanic {
                        index,
                        message: message.clone(),
                    });
                }
                ExecStatus::Executed => {}
            }
            self.apply_outcome(outcome);
            self.tasks[index].status = TaskStatus::Validated;
        }
        info!(
            from = start,
            iterations = self.iteration,
            "sequential execution finished"
        );
        Ok(())
    }

    // A failed transaction must not hold speculative writes in any store,
    // whatever its validation verdict was.
    fn pre_commit_check(&self) -> Result<(), EngineFault> {
        self.check_panics()?;
        for task in &self.tasks {
            if task.status != TaskStatus::Validated {
                return Err(EngineFault::NotValidated {
                    index: task.index,
                    status: task.status,
                });
            }
            let response = task.response.as_ref().ok_or(EngineFault::MissingResponse {
                index: task.index,
            })?;
            if response.is_ok() {
                continue;
            }
            for store in &self.stores {
                let keys = store.mv.writeset_keys(task.index);
                if !keys.is_empty() {
                    return Err(EngineFault::FailedTxWrites {
                        index: task.index,
                        store: store.name.to_string(),
                        keys: keys.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn into_results(self) -> Result<Vec<TxResult>, EngineFault> {
        self.tasks
            .into_iter()
            .map(|task| {
                task.response
                    .ok_or(EngineFault::MissingResponse { index: task.index })
            })
            .collect()
    }
}
