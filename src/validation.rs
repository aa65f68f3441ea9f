use crate::gas::{GasConfig, GasMeter};
use crate::iterator::{overlay_for, MergeIter};
use crate::tracking::IterationTracker;
use crate::types::{MVMemory, ParentStore, TxIndex};
use std::collections::BTreeSet;
use tracing::trace;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    /// Lower transactions whose estimates were observed.
    pub conflicts: BTreeSet<TxIndex>,
}

impl Verdict {
    pub fn valid() -> Self {
        Verdict {
            valid: true,
            conflicts: BTreeSet::new(),
        }
    }

    pub fn merge(&mut self, other: Verdict) {
        self.valid &= other.valid;
        self.conflicts.extend(other.conflicts);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterVerdict {
    Valid,
    Invalid,
    Aborted { blocking: TxIndex },
}

/// Re-reads every recorded key of `tx_index`. An estimate is a soft
/// conflict: the writer is reported but the read is not invalidated.
pub fn validate_readset<M: MVMemory + ?Sized, P: ParentStore + ?Sized>(
    mv: &M,
    parent: &P,
    tx_index: TxIndex,
    gas: &GasConfig,
    meter: &mut GasMeter,
) -> Verdict {
    let mut verdict = Verdict::valid();
    for (key, observed) in mv.get_readset(tx_index) {
        if meter.consume(gas.read_cost_flat, "validate read").is_err() {
            verdict.valid = false;
            return verdict;
        }
        let [value] = observed.as_slice() else {
            // read more than one value for the same key
            verdict.valid = false;
            continue;
        };
        match mv.get_latest_before_index(&key, tx_index) {
            None => {
                if parent.get(&key) != *value {
                    verdict.valid = false;
                }
            }
            Some(latest) if latest.is_estimate => {
                verdict.conflicts.insert(latest.tx_index);
            }
            Some(latest) if latest.is_deleted => {
                if value.is_some() {
                    verdict.valid = false;
                }
            }
            Some(latest) => {
                if latest.value != *value {
                    verdict.valid = false;
                }
            }
        }
    }
    verdict
}

/// Walks the current merged view of the tracker's range and checks that it
/// yields exactly the keys the transaction saw, up to where it stopped.
pub fn validate_iterator<M: MVMemory + ?Sized, P: ParentStore + ?Sized>(
    mv: &M,
    parent: &P,
    tx_index: TxIndex,
    tracker: &IterationTracker,
    gas: &GasConfig,
    meter: &mut GasMeter,
) -> IterVerdict {
    let (start, end) = (tracker.start.as_deref(), tracker.end.as_deref());
    let overlay = overlay_for(mv, tx_index, start, end, &tracker.writeset);
    let merged = MergeIter::new(parent, overlay, start, end, tracker.order);

    let expected = tracker.iterated_keys.len();
    // a walk cut short by its limit never looked past its last key
    let stopped_early = tracker.early_stop_key.is_some() || tracker.limit == Some(expected);
    let mut visited = 0;
    for item in merged {
        if stopped_early && visited == expected {
            return IterVerdict::Valid;
        }
        if meter.consume(gas.iter_next_cost_flat, "validate iterator").is_err() {
            return IterVerdict::Invalid;
        }
        match item {
            Err((_, blocking)) => return IterVerdict::Aborted { blocking },
            Ok((key, _)) => {
                if !tracker.iterated_keys.contains(&key) {
                    trace!(tx_index, key = ?key, "iterator yields unseen key");
                    return IterVerdict::Invalid;
                }
                visited += 1;
            }
        }
    }
    if visited == expected {
        IterVerdict::Valid
    } else {
        IterVerdict::Invalid
    }
}

pub fn validate_transaction_state<M: MVMemory + ?Sized, P: ParentStore + ?Sized>(
    mv: &M,
    parent: &P,
    tx_index: TxIndex,
    gas: &GasConfig,
    meter: &mut GasMeter,
) -> Verdict {
    let mut verdict = Verdict::valid();
    for tracker in mv.get_iterateset(tx_index) {
        match validate_iterator(mv, parent, tx_index, &tracker, gas, meter) {
            IterVerdict::Valid => {}
            IterVerdict::Invalid => verdict.valid = false,
            IterVerdict::Aborted { blocking } => {
                verdict.valid = false;
                verdict.conflicts.insert(blocking);
            }
        }
    }
    verdict.merge(validate_readset(mv, parent, tx_index, gas, meter));
    verdict
}
