use crate::capability::{self, Capability, ScopedCapabilities};
use crate::error::ExecError;
use crate::ledger::{self, Ledger, LedgerParams};
use crate::types::{Event, KvStore, Order, VM};
use crate::version_indexed::TxContext;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

pub const BANK: &str = "bank";

pub const CODE_NOT_A_NUMBER: u32 = 2;
pub const CODE_OVERFLOW: u32 = 3;
pub const CODE_INSUFFICIENT_FUNDS: u32 = 5;

pub const OP_GAS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Get { store: String, key: String },
    Set { store: String, key: String, value: String },
    Delete { store: String, key: String },
    Copy { store: String, from: String, to: String },
    Add { store: String, key: String, amount: u64 },
    Transfer { store: String, from: String, to: String, amount: u64 },
    /// Counts up to `limit` entries of `[start, end)` and writes the count to
    /// `into`.
    Scan {
        store: String,
        start: Option<String>,
        end: Option<String>,
        limit: Option<usize>,
        into: String,
    },
    Fail { code: u32 },
    Sleep { micros: u64 },
    NewCapability { module: String, name: String },
    ReleaseCapability { module: String, name: String },
    CreateValidator { operator: String, tokens: u64, height: u64 },
    BeginUnbonding { operator: String, height: u64 },
    MatureUnbondings { height: u64 },
    Slash { operator: String, fraction_bps: u64 },
    RemoveValidator { operator: String },
}

impl Op {
    pub fn get(store: &str, key: &str) -> Op {
        Op::Get {
            store: store.into(),
            key: key.into(),
        }
    }

    pub fn set(store: &str, key: &str, value: &str) -> Op {
        Op::Set {
            store: store.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(store: &str, key: &str) -> Op {
        Op::Delete {
            store: store.into(),
            key: key.into(),
        }
    }

    pub fn add(store: &str, key: &str, amount: u64) -> Op {
        Op::Add {
            store: store.into(),
            key: key.into(),
            amount,
        }
    }

    pub fn copy(store: &str, from: &str, to: &str) -> Op {
        Op::Copy {
            store: store.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn transfer(from: &str, to: &str, amount: u64) -> Op {
        Op::Transfer {
            store: BANK.into(),
            from: from.into(),
            to: to.into(),
            amount,
        }
    }

    pub fn scan(store: &str, start: Option<&str>, end: Option<&str>, limit: Option<usize>, into: &str) -> Op {
        Op::Scan {
            store: store.into(),
            start: start.map(Into::into),
            end: end.map(Into::into),
            limit,
            into: into.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTx {
    pub gas_limit: u64,
    pub ops: Vec<Op>,
}

impl ScriptTx {
    pub const DEFAULT_GAS_LIMIT: u64 = 10_000_000;

    pub fn new(ops: Vec<Op>) -> Self {
        ScriptTx {
            gas_limit: Self::DEFAULT_GAS_LIMIT,
            ops,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScriptVm {
    ledger: Ledger,
    /// Upper bound of a random pause before each op, to shake up the order
    /// in which workers finish.
    jitter: Option<Duration>,
}

impl ScriptVm {
    pub fn new(params: LedgerParams) -> Self {
        ScriptVm {
            ledger: Ledger::new(params),
            jitter: None,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    fn pause(&self) {
        if let Some(jitter) = self.jitter {
            let micros = jitter.as_micros() as u64;
            if micros > 0 {
                let pause = rand::thread_rng().gen_range(0..=micros);
                thread::sleep(Duration::from_micros(pause));
            }
        }
    }

    fn run_op(&self, op: &Op, ctx: &mut TxContext<'_>, events: &mut Vec<Event>) -> Result<(), ExecError> {
        match op {
            Op::Get { store, key } => {
                let value = ctx.store(store)?.get(key.as_bytes())?;
                let shown = value.map_or_else(
                    || "<nil>".to_string(),
                    |v| String::from_utf8_lossy(&v).into_owned(),
                );
                events.push(Event::new("get").attr("key", key.as_str()).attr("value", shown));
            }
            Op::Set { store, key, value } => {
                ctx.store(store)?
                    .set(key.as_bytes(), value.as_bytes().to_vec())?;
            }
            Op::Delete { store, key } => {
                ctx.store(store)?.delete(key.as_bytes())?;
            }
            Op::Copy { store, from, to } => {
                let mut view = ctx.store(store)?;
                match view.get(from.as_bytes())? {
                    Some(value) => view.set(to.as_bytes(), value)?,
                    None => view.delete(to.as_bytes())?,
                }
            }
            Op::Add { store, key, amount } => {
                let mut view = ctx.store(store)?;
                let current = read_u64(&mut view, key)?;
                let next = current
                    .checked_add(*amount)
                    .ok_or_else(|| ExecError::app(CODE_OVERFLOW, format!("{key} overflows")))?;
                view.set(key.as_bytes(), next.to_string().into_bytes())?;
            }
            Op::Transfer {
                store,
                from,
                to,
                amount,
            } => {
                let mut view = ctx.store(store)?;
                let balance = read_u64(&mut view, from)?;
                if balance < *amount {
                    return Err(ExecError::app(
                        CODE_INSUFFICIENT_FUNDS,
                        format!("{from} has {balance}, needs {amount}"),
                    ));
                }
                view.set(from.as_bytes(), (balance - amount).to_string().into_bytes())?;
                let credited = read_u64(&mut view, to)?
                    .checked_add(*amount)
                    .ok_or_else(|| ExecError::app(CODE_OVERFLOW, format!("{to} overflows")))?;
                view.set(to.as_bytes(), credited.to_string().into_bytes())?;
                events.push(
                    Event::new("transfer")
                        .attr("from", from.as_str())
                        .attr("to", to.as_str())
                        .attr("amount", amount.to_string()),
                );
            }
            Op::Scan {
                store,
                start,
                end,
                limit,
                into,
            } => {
                let mut view = ctx.store(store)?;
                let items = view.range(
                    start.as_deref().map(str::as_bytes),
                    end.as_deref().map(str::as_bytes),
                    Order::Ascending,
                    *limit,
                )?;
                view.set(into.as_bytes(), items.len().to_string().into_bytes())?;
                let keys: Vec<_> = items
                    .iter()
                    .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
                    .collect();
                events.push(Event::new("scan").attr("keys", keys.join(",")));
            }
            Op::Fail { code } => {
                return Err(ExecError::app(*code, "script requested failure"));
            }
            Op::Sleep { micros } => thread::sleep(Duration::from_micros(*micros)),
            Op::NewCapability { module, name } => {
                let mut view = ctx.store(capability::STORE)?;
                let cap = ScopedCapabilities::new(module.as_str()).new_capability(&mut view, name)?;
                events.push(
                    Event::new("new_capability")
                        .attr("module", module.as_str())
                        .attr("index", cap.index.to_string()),
                );
            }
            Op::ReleaseCapability { module, name } => {
                let mut view = ctx.store(capability::STORE)?;
                let scoped = ScopedCapabilities::new(module.as_str());
                let cap: Capability = scoped
                    .get_capability(&mut view, name)?
                    .ok_or_else(|| capability::CapabilityError::NotFound {
                        module: module.clone(),
                        name: name.clone(),
                    })?;
                scoped.release_capability(&mut view, cap)?;
            }
            Op::CreateValidator {
                operator,
                tokens,
                height,
            } => {
                let mut view = ctx.store(ledger::STORE)?;
                self.ledger
                    .create_validator(&mut view, operator, *tokens, *height)?;
            }
            Op::BeginUnbonding { operator, height } => {
                let mut view = ctx.store(ledger::STORE)?;
                self.ledger.begin_unbonding(&mut view, operator, *height)?;
            }
            Op::MatureUnbondings { height } => {
                let mut view = ctx.store(ledger::STORE)?;
                let matured = self.ledger.mature_unbondings(&mut view, *height)?;
                events.push(Event::new("matured").attr("operators", matured.join(",")));
            }
            Op::Slash {
                operator,
                fraction_bps,
            } => {
                let mut view = ctx.store(ledger::STORE)?;
                if let Some(burned) = self.ledger.slash(&mut view, operator, *fraction_bps)? {
                    events.push(
                        Event::new("slash")
                            .attr("operator", operator.as_str())
                            .attr("burned", burned.to_string()),
                    );
                }
            }
            Op::RemoveValidator { operator } => {
                let mut view = ctx.store(ledger::STORE)?;
                self.ledger.remove_validator(&mut view, operator)?;
            }
        }
        Ok(())
    }
}

fn read_u64<K: KvStore + ?Sized>(store: &mut K, key: &str) -> Result<u64, ExecError> {
    match store.get(key.as_bytes())? {
        None => Ok(0),
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExecError::app(CODE_NOT_A_NUMBER, format!("{key} is not a number"))),
    }
}

impl VM for ScriptVm {
    type Tx = ScriptTx;

    fn gas_limit(&self, tx: &ScriptTx) -> u64 {
        tx.gas_limit
    }

    fn execute(&self, tx: &ScriptTx, ctx: &mut TxContext<'_>) -> Result<Vec<Event>, ExecError> {
        let mut events = Vec::new();
        for op in &tx.ops {
            self.pause();
            ctx.consume_gas(OP_GAS, "ScriptOp")?;
            self.run_op(op, ctx, &mut events)?;
        }
        Ok(events)
    }
}
