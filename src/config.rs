use crate::error::EngineFault;
use crate::gas::GasConfig;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::thread;

pub const MAX_ITERATIONS_CAP: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads; `None` picks `min(available_parallelism, batch_len)`.
    pub workers: Option<usize>,
    /// Parallel rounds before the unvalidated suffix is executed sequentially.
    pub max_iterations: usize,
    pub deadline_ms: Option<u64>,
    pub gas: GasConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: None,
            max_iterations: 10,
            deadline_ms: None,
            gas: GasConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self, EngineFault> {
        let config: SchedulerConfig =
            serde_json::from_str(json).map_err(|e| EngineFault::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineFault> {
        if self.workers == Some(0) {
            return Err(EngineFault::Config("workers must be at least 1".into()));
        }
        if self.max_iterations > MAX_ITERATIONS_CAP {
            return Err(EngineFault::Config(format!(
                "max_iterations {} exceeds {}",
                self.max_iterations, MAX_ITERATIONS_CAP
            )));
        }
        if self.deadline_ms == Some(0) {
            return Err(EngineFault::Config("deadline_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn resolve_workers(&self, batch_len: usize) -> usize {
        match self.workers {
            Some(workers) => workers,
            None => {
                let cpus = thread::available_parallelism().map_or(1, NonZeroUsize::get);
                cpus.min(batch_len).max(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SchedulerConfig::from_json(r#"{"workers": 4, "gas": {"has_cost": 7}}"#).unwrap();
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.gas.has_cost, 7);
        assert_eq!(config.gas.read_cost_flat, 1000);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            SchedulerConfig::from_json(r#"{"workers": 0}"#),
            Err(EngineFault::Config(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_json(r#"{"max_iterations": 5000}"#),
            Err(EngineFault::Config(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_json("not json"),
            Err(EngineFault::Config(_))
        ));
    }

    #[test]
    fn default_workers_bounded_by_batch() {
        let config = SchedulerConfig::default();
        assert_eq!(config.resolve_workers(1), 1);
        assert_eq!(config.resolve_workers(0), 1);
        let explicit = SchedulerConfig {
            workers: Some(3),
            ..Default::default()
        };
        assert_eq!(explicit.resolve_workers(100), 3);
    }
}
