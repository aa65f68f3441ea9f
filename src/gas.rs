use crate::error::StoreError;
use crate::tracking::{IterationTracker, ReadSet};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    pub has_cost: u64,
    pub delete_cost: u64,
    pub read_cost_flat: u64,
    pub read_cost_per_byte: u64,
    pub write_cost_flat: u64,
    pub write_cost_per_byte: u64,
    pub iter_next_cost_flat: u64,
    pub iter_next_cost_per_byte: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        GasConfig {
            has_cost: 1000,
            delete_cost: 1000,
            read_cost_flat: 1000,
            read_cost_per_byte: 3,
            write_cost_flat: 2000,
            write_cost_per_byte: 30,
            iter_next_cost_flat: 30,
            iter_next_cost_per_byte: 3,
        }
    }
}

impl GasConfig {
    /// Cost of replaying every recorded read and iterator step once.
    pub fn replay_cost(&self, readset: &ReadSet, iterations: &[IterationTracker]) -> u64 {
        let reads = readset.len() as u64;
        let steps: u64 = iterations
            .iter()
            // a replay may step once past the recorded keys
            .map(|tracker| tracker.iterated_keys.len() as u64 + 1)
            .sum();
        reads
            .saturating_mul(self.read_cost_flat)
            .saturating_add(steps.saturating_mul(self.iter_next_cost_flat))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GasMeter {
    limit: u64,
    consumed: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        GasMeter { limit, consumed: 0 }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }

    /// Charges `amount`. On overflow the meter is left saturated at the limit.
    pub fn consume(&mut self, amount: u64, descriptor: &'static str) -> Result<(), StoreError> {
        let used = self.consumed.saturating_add(amount);
        if used > self.limit {
            self.consumed = self.limit;
            return Err(StoreError::OutOfGas {
                descriptor,
                limit: self.limit,
                used,
            });
        }
        self.consumed = used;
        Ok(())
    }
}
