use crate::{
    config::{Config, ConfigError, RunConfig},
    cross_validation::{CrossValidation, FoldResult, RunResult},
    result::Result,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A row of the [`Sweep`] table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepEntry {
    /// The execution id.
    pub id: u64,
    /// The number of epochs.
    pub epochs: usize,
    /// Index into [`Sweep::decay_strategies`].
    pub decay_strategy: usize,
    /// The weight decay.
    pub weight_decay: f32,
    /// The initial learning rate.
    pub learning_rate: f32,
}

impl SweepEntry {
    const fn new(
        id: u64,
        epochs: usize,
        decay_strategy: usize,
        weight_decay: f32,
        learning_rate: f32,
    ) -> Self {
        Self {
            id,
            epochs,
            decay_strategy,
            weight_decay,
            learning_rate,
        }
    }
}

/// An ordered table of hyperparameters, each row a cross-validated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    /// Learning rate decay epochs.
    pub decay_strategies: Vec<Vec<usize>>,
    /// The runs, in order.
    pub entries: Vec<SweepEntry>,
}

impl Default for Sweep {
    fn default() -> Self {
        Self {
            decay_strategies: vec![
                vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 300],
                vec![40, 80, 100, 300],
            ],
            entries: vec![
                SweepEntry::new(8, 100, 0, 0.0001, 0.001),
                SweepEntry::new(11, 100, 0, 0.0001, 0.0005),
                SweepEntry::new(6, 100, 1, 0.0001, 0.005),
                SweepEntry::new(65, 200, 0, 0.0001, 0.001),
                SweepEntry::new(67, 200, 1, 0.0001, 0.005),
            ],
        }
    }
}

impl Sweep {
    /// Checks that every entry names an existing decay strategy and has a usable learning rate and
    /// weight decay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in self.entries.iter() {
            if entry.decay_strategy >= self.decay_strategies.len() {
                return Err(ConfigError::DecayStrategy {
                    id: entry.id,
                    index: entry.decay_strategy,
                    count: self.decay_strategies.len(),
                });
            }
            if !(entry.learning_rate.is_finite() && entry.learning_rate > 0.) {
                return Err(ConfigError::Hyperparameter {
                    id: entry.id,
                    field: "learning_rate",
                    value: entry.learning_rate,
                });
            }
            if !(entry.weight_decay.is_finite() && entry.weight_decay >= 0.) {
                return Err(ConfigError::Hyperparameter {
                    id: entry.id,
                    field: "weight_decay",
                    value: entry.weight_decay,
                });
            }
        }
        Ok(())
    }
    /// The entry with `id`.
    pub fn entry(&self, id: u64) -> Option<&SweepEntry> {
        self.entries.iter().find(|x| x.id == id)
    }
    /// The [`RunConfig`] of `entry`.
    ///
    /// **Errors**
    /// The decay strategy does not exist.
    pub fn run_config(&self, config: &Config, entry: &SweepEntry) -> Result<RunConfig> {
        let lr_decay_epochs = self
            .decay_strategies
            .get(entry.decay_strategy)
            .ok_or(ConfigError::DecayStrategy {
                id: entry.id,
                index: entry.decay_strategy,
                count: self.decay_strategies.len(),
            })?
            .clone();
        Ok(RunConfig {
            execution_id: entry.id,
            network: config.network.clone(),
            optimizer: config.optimizer,
            learning_rate: entry.learning_rate,
            weight_decay: entry.weight_decay,
            epochs: entry.epochs,
            lr_decay_epochs,
            fold_count: config.fold_count,
        })
    }
    /// The [`RunConfig`]s of every entry, in order.
    ///
    /// **Errors**
    /// See [`.run_config()`](Self::run_config).
    pub fn run_configs(&self, config: &Config) -> Result<Vec<RunConfig>> {
        self.entries
            .iter()
            .map(|entry| self.run_config(config, entry))
            .collect()
    }
    /// Cross-validates every entry, strictly in order.
    ///
    /// `on_fold` is called with the run and each completed fold. Stops at the first error, results
    /// of completed runs are already in the log.
    pub fn run(
        &self,
        config: &Config,
        cross_validation: &CrossValidation,
        mut on_fold: impl FnMut(&RunConfig, &FoldResult),
    ) -> Result<Vec<RunResult>> {
        let runs = self.run_configs(config)?;
        info!(runs = runs.len(), "sweep");
        runs.iter()
            .map(|run| cross_validation.run(run, |fold| on_fold(run, fold)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table() -> Result<()> {
        let config = Config::default();
        let runs = Sweep::default().run_configs(&config)?;
        let ids: Vec<u64> = runs.iter().map(|x| x.execution_id).collect();
        assert_eq!(ids, [8, 11, 6, 65, 67]);
        assert_eq!(runs[2].lr_decay_epochs, [40, 80, 100, 300]);
        assert_eq!(runs[3].epochs, 200);
        assert_eq!(runs[0].lr_decay_epochs.len(), 11);
        assert!(runs.iter().all(|x| x.fold_count == 5 && x.network == "pooled_dense"));
        Ok(())
    }

    #[test]
    fn bad_strategy_index() {
        let mut sweep = Sweep::default();
        sweep.entries.push(SweepEntry::new(99, 1, 2, 0., 0.1));
        assert!(matches!(
            sweep.validate(),
            Err(ConfigError::DecayStrategy {
                id: 99,
                index: 2,
                count: 2
            })
        ));
        assert!(sweep.run_configs(&Config::default()).is_err());
    }

    #[test]
    fn bad_learning_rate() {
        let sweep = Sweep {
            decay_strategies: vec![vec![]],
            entries: vec![SweepEntry::new(1, 1, 0, 0., 0.)],
        };
        assert!(matches!(
            sweep.validate(),
            Err(ConfigError::Hyperparameter {
                field: "learning_rate",
                ..
            })
        ));
    }

    #[test]
    fn lookup() {
        let sweep = Sweep::default();
        assert_eq!(sweep.entry(65).map(|x| x.epochs), Some(200));
        assert!(sweep.entry(1).is_none());
    }
}
