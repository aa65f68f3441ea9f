use crate::error::{ExecError, StoreError};
use crate::types::{prefix_end, KvStore, Order, CODE_INTERNAL};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub const STORE: &str = "staking";

const VALIDATOR_PREFIX: &str = "validators/";
const SIGNING_PREFIX: &str = "signing/";
const UNBONDING_PREFIX: &str = "unbonding/";

pub const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorStatus {
    Bonded,
    Unbonding,
    Unbonded,
}

impl fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidatorStatus::Bonded => "bonded",
            ValidatorStatus::Unbonding => "unbonding",
            ValidatorStatus::Unbonded => "unbonded",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub operator: String,
    pub status: ValidatorStatus,
    pub tokens: u64,
    pub jailed: bool,
    pub unbonding_height: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInfo {
    pub operator: String,
    pub start_height: u64,
    pub missed_blocks: u64,
    pub jailed_until: Option<u64>,
    pub tombstoned: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validator {0} already exists")]
    AlreadyExists(String),
    #[error("cannot {action} validator {operator} (status {status}, jailed {jailed})")]
    InvalidTransition {
        operator: String,
        action: &'static str,
        status: ValidatorStatus,
        jailed: bool,
    },
    #[error("slash fraction {0} bps is above 10000")]
    InvalidFraction(u64),
    #[error("corrupt ledger entry: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LedgerError> for ExecError {
    fn from(err: LedgerError) -> Self {
        let code = match &err {
            LedgerError::Store(store) => return ExecError::Store(store.clone()),
            LedgerError::AlreadyExists(_) => 31,
            LedgerError::InvalidTransition { .. } => 32,
            LedgerError::InvalidFraction(_) => 33,
            LedgerError::Corrupt(_) => CODE_INTERNAL,
        };
        ExecError::app(code, err.to_string())
    }
}

fn validator_key(operator: &str) -> Vec<u8> {
    format!("{VALIDATOR_PREFIX}{operator}").into_bytes()
}

fn signing_key(operator: &str) -> Vec<u8> {
    format!("{SIGNING_PREFIX}{operator}").into_bytes()
}

fn unbonding_key(height: u64, operator: &str) -> Vec<u8> {
    format!("{UNBONDING_PREFIX}{height:020}/{operator}").into_bytes()
}

fn load<K: KvStore + ?Sized, T: DeserializeOwned>(
    store: &mut K,
    key: &[u8],
) -> Result<Option<T>, LedgerError> {
    match store.get(key)? {
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| LedgerError::Corrupt(e.to_string())),
        None => Ok(None),
    }
}

fn save<K: KvStore + ?Sized, T: Serialize>(
    store: &mut K,
    key: &[u8],
    value: &T,
) -> Result<(), LedgerError> {
    let raw = serde_json::to_vec(value).map_err(|e| LedgerError::Corrupt(e.to_string()))?;
    store.set(key, raw)?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerParams {
    pub unbonding_period: u64,
    pub jail_duration: u64,
    pub max_missed_blocks: u64,
    pub downtime_slash_bps: u64,
}

impl Default for LedgerParams {
    fn default() -> Self {
        LedgerParams {
            unbonding_period: 100,
            jail_duration: 10,
            max_missed_blocks: 50,
            downtime_slash_bps: 100,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Ledger {
    params: LedgerParams,
}

impl Ledger {
    pub fn new(params: LedgerParams) -> Self {
        Ledger { params }
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    pub fn get_validator<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
    ) -> Result<Option<Validator>, LedgerError> {
        load(store, &validator_key(operator))
    }

    pub fn get_signing_info<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
    ) -> Result<Option<SigningInfo>, LedgerError> {
        load(store, &signing_key(operator))
    }

    fn existing<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        action: &'static str,
    ) -> Result<Option<Validator>, LedgerError> {
        let validator = self.get_validator(store, operator)?;
        if validator.is_none() {
            warn!(operator, action, "validator not found, skipping");
        }
        Ok(validator)
    }

    pub fn create_validator<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        tokens: u64,
        height: u64,
    ) -> Result<Validator, LedgerError> {
        if store.has(&validator_key(operator))? {
            return Err(LedgerError::AlreadyExists(operator.to_string()));
        }
        let validator = Validator {
            operator: operator.to_string(),
            status: ValidatorStatus::Bonded,
            tokens,
            jailed: false,
            unbonding_height: None,
        };
        save(store, &validator_key(operator), &validator)?;
        let info = SigningInfo {
            operator: operator.to_string(),
            start_height: height,
            missed_blocks: 0,
            jailed_until: None,
            tombstoned: false,
        };
        save(store, &signing_key(operator), &info)?;
        Ok(validator)
    }

    pub fn bond<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        amount: u64,
    ) -> Result<Option<Validator>, LedgerError> {
        let Some(mut validator) = self.existing(store, operator, "bond")? else {
            return Ok(None);
        };
        if validator.jailed {
            return Err(invalid(&validator, "bond"));
        }
        if let Some(height) = validator.unbonding_height.take() {
            store.delete(&unbonding_key(height, operator))?;
        }
        validator.status = ValidatorStatus::Bonded;
        validator.tokens = validator.tokens.saturating_add(amount);
        save(store, &validator_key(operator), &validator)?;
        Ok(Some(validator))
    }

    pub fn begin_unbonding<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        height: u64,
    ) -> Result<Option<Validator>, LedgerError> {
        let Some(mut validator) = self.existing(store, operator, "unbond")? else {
            return Ok(None);
        };
        self.start_unbonding(store, &mut validator, height)?;
        save(store, &validator_key(operator), &validator)?;
        Ok(Some(validator))
    }

    fn start_unbonding<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        validator: &mut Validator,
        height: u64,
    ) -> Result<(), LedgerError> {
        if validator.status != ValidatorStatus::Bonded {
            return Err(invalid(validator, "unbond"));
        }
        let matures = height.saturating_add(self.params.unbonding_period);
        validator.status = ValidatorStatus::Unbonding;
        validator.unbonding_height = Some(matures);
        store.set(&unbonding_key(matures, &validator.operator), Vec::new())?;
        Ok(())
    }

    /// Moves every validator whose unbonding matured at or before `height`
    /// to unbonded. Returns the operators in queue order.
    pub fn mature_unbondings<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        height: u64,
    ) -> Result<Vec<String>, LedgerError> {
        let start = UNBONDING_PREFIX.as_bytes().to_vec();
        let end = match height.checked_add(1) {
            Some(next) => format!("{UNBONDING_PREFIX}{next:020}").into_bytes(),
            None => prefix_end(&start).unwrap_or_default(),
        };
        let due = store.range(Some(start.as_slice()), Some(end.as_slice()), Order::Ascending, None)?;

        let mut matured = Vec::with_capacity(due.len());
        for (key, _) in due {
            store.delete(&key)?;
            let operator = std::str::from_utf8(&key[start.len()..])
                .ok()
                .and_then(|rest| rest.split_once('/'))
                .map(|(_, operator)| operator.to_string())
                .ok_or_else(|| LedgerError::Corrupt(format!("bad queue key {key:?}")))?;
            let Some(mut validator) = self.existing(store, &operator, "mature")? else {
                continue;
            };
            if validator.status != ValidatorStatus::Unbonding {
                debug!(operator = %operator, status = %validator.status, "stale unbonding entry");
                continue;
            }
            validator.status = ValidatorStatus::Unbonded;
            validator.unbonding_height = None;
            save(store, &validator_key(&operator), &validator)?;
            matured.push(operator);
        }
        Ok(matured)
    }

    /// Jails the validator until `height + jail_duration`. A bonded validator
    /// starts unbonding.
    pub fn jail<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        height: u64,
    ) -> Result<Option<Validator>, LedgerError> {
        let Some(mut validator) = self.existing(store, operator, "jail")? else {
            return Ok(None);
        };
        if validator.jailed {
            return Err(invalid(&validator, "jail"));
        }
        validator.jailed = true;
        if validator.status == ValidatorStatus::Bonded {
            self.start_unbonding(store, &mut validator, height)?;
        }
        save(store, &validator_key(operator), &validator)?;

        if let Some(mut info) = self.get_signing_info(store, operator)? {
            info.jailed_until = Some(height.saturating_add(self.params.jail_duration));
            save(store, &signing_key(operator), &info)?;
        } else {
            warn!(operator, "signing info not found, skipping");
        }
        Ok(Some(validator))
    }

    pub fn unjail<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        height: u64,
    ) -> Result<Option<Validator>, LedgerError> {
        let Some(mut validator) = self.existing(store, operator, "unjail")? else {
            return Ok(None);
        };
        if !validator.jailed {
            return Err(invalid(&validator, "unjail"));
        }
        if let Some(info) = self.get_signing_info(store, operator)? {
            let still_jailed = info.jailed_until.is_some_and(|until| height < until);
            if info.tombstoned || still_jailed {
                return Err(invalid(&validator, "unjail"));
            }
        }
        validator.jailed = false;
        save(store, &validator_key(operator), &validator)?;
        Ok(Some(validator))
    }

    /// Burns `fraction_bps / 10000` of the validator's tokens and returns the
    /// burned amount.
    pub fn slash<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        fraction_bps: u64,
    ) -> Result<Option<u64>, LedgerError> {
        if fraction_bps > BPS_DENOMINATOR {
            return Err(LedgerError::InvalidFraction(fraction_bps));
        }
        let Some(mut validator) = self.existing(store, operator, "slash")? else {
            return Ok(None);
        };
        if validator.status == ValidatorStatus::Unbonded {
            return Err(invalid(&validator, "slash"));
        }
        let burned = (validator.tokens as u128 * fraction_bps as u128 / BPS_DENOMINATOR as u128) as u64;
        validator.tokens -= burned;
        save(store, &validator_key(operator), &validator)?;
        Ok(Some(burned))
    }

    /// Counts a missed block; past `max_missed_blocks` the validator is
    /// slashed for downtime and jailed, and the counter restarts.
    pub fn record_missed_block<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
        height: u64,
    ) -> Result<Option<SigningInfo>, LedgerError> {
        let Some(mut info) = self.get_signing_info(store, operator)? else {
            warn!(operator, "signing info not found, skipping");
            return Ok(None);
        };
        info.missed_blocks += 1;
        if info.missed_blocks > self.params.max_missed_blocks {
            let jailed = self
                .get_validator(store, operator)?
                .is_some_and(|v| v.jailed);
            if !jailed {
                self.slash(store, operator, self.params.downtime_slash_bps)?;
                self.jail(store, operator, height)?;
                info = self.get_signing_info(store, operator)?.unwrap_or(info);
            }
            info.missed_blocks = 0;
        }
        save(store, &signing_key(operator), &info)?;
        Ok(Some(info))
    }

    /// Deletes an unbonded validator together with its signing info, so
    /// both disappear in the same writeset.
    pub fn remove_validator<K: KvStore + ?Sized>(
        &self,
        store: &mut K,
        operator: &str,
    ) -> Result<bool, LedgerError> {
        let Some(validator) = self.existing(store, operator, "remove")? else {
            return Ok(false);
        };
        if validator.status != ValidatorStatus::Unbonded {
            return Err(invalid(&validator, "remove"));
        }
        store.delete(&validator_key(operator))?;
        store.delete(&signing_key(operator))?;
        Ok(true)
    }

    pub fn validators<K: KvStore + ?Sized>(&self, store: &mut K) -> Result<Vec<Validator>, LedgerError> {
        let start = VALIDATOR_PREFIX.as_bytes();
        let end = prefix_end(start);
        store
            .range(Some(start), end.as_deref(), Order::Ascending, None)?
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(|e| LedgerError::Corrupt(e.to_string())))
            .collect()
    }
}

fn invalid(validator: &Validator, action: &'static str) -> LedgerError {
    LedgerError::InvalidTransition {
        operator: validator.operator.clone(),
        action,
        status: validator.status,
        jailed: validator.jailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn ledger() -> Ledger {
        Ledger::new(LedgerParams {
            unbonding_period: 10,
            jail_duration: 5,
            max_missed_blocks: 2,
            downtime_slash_bps: 1000,
        })
    }

    #[test]
    fn unbonding_matures_through_the_queue() {
        let ledger = ledger();
        let mut store = MemStore::new();
        ledger.create_validator(&mut store, "alice", 100, 1).unwrap();
        ledger.create_validator(&mut store, "bob", 100, 1).unwrap();
        ledger.begin_unbonding(&mut store, "alice", 5).unwrap();
        ledger.begin_unbonding(&mut store, "bob", 8).unwrap();

        assert!(ledger.mature_unbondings(&mut store, 14).unwrap().is_empty());
        assert_eq!(ledger.mature_unbondings(&mut store, 15).unwrap(), vec!["alice"]);
        assert_eq!(ledger.mature_unbondings(&mut store, 100).unwrap(), vec!["bob"]);

        let alice = ledger.get_validator(&mut store, "alice").unwrap().unwrap();
        assert_eq!(alice.status, ValidatorStatus::Unbonded);
        assert_eq!(alice.unbonding_height, None);
    }

    #[test]
    fn rebonding_cancels_queue_entry() {
        let ledger = ledger();
        let mut store = MemStore::new();
        ledger.create_validator(&mut store, "alice", 100, 1).unwrap();
        ledger.begin_unbonding(&mut store, "alice", 5).unwrap();
        let alice = ledger.bond(&mut store, "alice", 50).unwrap().unwrap();
        assert_eq!((alice.status, alice.tokens), (ValidatorStatus::Bonded, 150));
        assert!(ledger.mature_unbondings(&mut store, 1000).unwrap().is_empty());
    }

    #[test]
    fn illegal_transitions_are_errors() {
        let ledger = ledger();
        let mut store = MemStore::new();
        ledger.create_validator(&mut store, "alice", 100, 1).unwrap();
        assert!(matches!(
            ledger.remove_validator(&mut store, "alice"),
            Err(LedgerError::InvalidTransition { action: "remove", .. })
        ));
        assert!(matches!(
            ledger.unjail(&mut store, "alice", 3),
            Err(LedgerError::InvalidTransition { action: "unjail", .. })
        ));
        assert_eq!(
            ledger.create_validator(&mut store, "alice", 1, 2),
            Err(LedgerError::AlreadyExists("alice".into()))
        );
        assert_eq!(
            ledger.slash(&mut store, "alice", 10_001),
            Err(LedgerError::InvalidFraction(10_001))
        );
    }

    #[test]
    fn missing_validator_is_skipped_everywhere() {
        let ledger = ledger();
        let mut store = MemStore::new();
        assert_eq!(ledger.bond(&mut store, "ghost", 1).unwrap(), None);
        assert_eq!(ledger.begin_unbonding(&mut store, "ghost", 1).unwrap(), None);
        assert_eq!(ledger.jail(&mut store, "ghost", 1).unwrap(), None);
        assert_eq!(ledger.unjail(&mut store, "ghost", 1).unwrap(), None);
        assert_eq!(ledger.slash(&mut store, "ghost", 100).unwrap(), None);
        assert_eq!(ledger.record_missed_block(&mut store, "ghost", 1).unwrap(), None);
        assert!(!ledger.remove_validator(&mut store, "ghost").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn downtime_slashes_and_jails() {
        let ledger = ledger();
        let mut store = MemStore::new();
        ledger.create_validator(&mut store, "alice", 1000, 1).unwrap();
        for height in 2..=4 {
            ledger.record_missed_block(&mut store, "alice", height).unwrap();
        }
        let alice = ledger.get_validator(&mut store, "alice").unwrap().unwrap();
        assert!(alice.jailed);
        assert_eq!(alice.tokens, 900);
        assert_eq!(alice.status, ValidatorStatus::Unbonding);

        let info = ledger.get_signing_info(&mut store, "alice").unwrap().unwrap();
        assert_eq!(info.missed_blocks, 0);
        assert_eq!(info.jailed_until, Some(9));

        assert!(ledger.unjail(&mut store, "alice", 8).is_err());
        let alice = ledger.unjail(&mut store, "alice", 9).unwrap().unwrap();
        assert!(!alice.jailed);
    }

    #[test]
    fn remove_deletes_validator_and_signing_info() {
        let ledger = ledger();
        let mut store = MemStore::new();
        ledger.create_validator(&mut store, "alice", 10, 1).unwrap();
        ledger.begin_unbonding(&mut store, "alice", 1).unwrap();
        ledger.mature_unbondings(&mut store, 11).unwrap();
        assert!(ledger.remove_validator(&mut store, "alice").unwrap());
        assert!(store.is_empty());
        assert!(ledger.validators(&mut store).unwrap().is_empty());
    }
}
