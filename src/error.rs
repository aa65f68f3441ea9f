use crate::types::{TaskStatus, TxIndex, CODE_INTERNAL, CODE_OUT_OF_GAS};
use thiserror::Error;

/// Raised by store accesses while a transaction executes. Both variants are
/// handled inside the engine and never escape `process_all`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("read hit an estimate written by transaction {blocking}")]
    Estimate { blocking: TxIndex },
    #[error("out of gas in {descriptor}: limit {limit}, used {used}")]
    OutOfGas {
        descriptor: &'static str,
        limit: u64,
        used: u64,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("execution failed with code {code}: {log}")]
    App { code: u32, log: String },
    #[error("store {0} is not registered")]
    UnknownStore(String),
}

impl ExecError {
    pub fn app(code: u32, log: impl Into<String>) -> Self {
        ExecError::App {
            code,
            log: log.into(),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ExecError::Store(StoreError::OutOfGas { .. }) => CODE_OUT_OF_GAS,
            ExecError::Store(StoreError::Estimate { .. }) => CODE_INTERNAL,
            ExecError::App { code, .. } => *code,
            ExecError::UnknownStore(_) => CODE_INTERNAL,
        }
    }
}

/// Fatal, batch-level failures. When one is returned nothing of the batch is
/// committed.
#[derive(Debug, Error)]
pub enum EngineFault {
    #[error("invalid scheduler config: {0}")]
    Config(String),
    #[error("batch deadline of {deadline_ms}ms exceeded after {iterations} iterations")]
    DeadlineExceeded { deadline_ms: u64, iterations: usize },
    #[error("transaction {index} reached commit in status {status}")]
    NotValidated { index: TxIndex, status: TaskStatus },
    #[error("transaction {index} has no response at commit")]
    MissingResponse { index: TxIndex },
    #[error("failed transaction {index} still holds {keys} speculative writes in store {store}")]
    FailedTxWrites {
        index: TxIndex,
        store: String,
        keys: usize,
    },
    #[error("estimate written by transaction {index} reached commit in store {store}")]
    EstimateAtCommit { store: String, index: TxIndex },
    #[error("store {0} is not registered")]
    UnknownStore(String),
    #[error("worker panicked while executing transaction {index}: {message}")]
    WorkerPanic { index: TxIndex, message: String },
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_into_exec_error() {
        let err: ExecError = StoreError::Estimate { blocking: 3 }.into();
        assert_eq!(err, ExecError::Store(StoreError::Estimate { blocking: 3 }));
        assert_eq!(
            err.to_string(),
            "read hit an estimate written by transaction 3"
        );
    }

    #[test]
    fn exec_error_codes() {
        let oog: ExecError = StoreError::OutOfGas {
            descriptor: "WriteFlat",
            limit: 10,
            used: 2000,
        }
        .into();
        assert_eq!(oog.code(), CODE_OUT_OF_GAS);
        assert_eq!(ExecError::app(7, "insufficient funds").code(), 7);
        assert_eq!(ExecError::UnknownStore("nope".into()).code(), CODE_INTERNAL);
    }

    #[test]
    fn fault_messages_name_the_transaction() {
        let fault = EngineFault::NotValidated {
            index: 4,
            status: TaskStatus::Waiting,
        };
        assert_eq!(
            fault.to_string(),
            "transaction 4 reached commit in status waiting"
        );
    }
}
