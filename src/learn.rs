use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    time::{Duration, Instant},
};

/// Criterions.
pub mod criterion;
/// Metrics.
pub mod metric;
/// Neural networks.
pub mod neural_network;
/// Learning rate schedules.
pub mod schedule;
/// The training loop.
pub mod train;

/// Training / testing statistics for one pass over a dataset.
#[derive(Default, Clone, Copy, Serialize, Deserialize)]
pub struct Stats {
    /// The number of samples.
    pub count: usize,
    /// The mean loss.
    pub loss: Option<f32>,
    /// The number of correct predictions.
    pub correct: usize,
}

impl Stats {
    /// The accuracy as a ratio between 0. and 1.
    ///
    /// None if count is 0.
    pub fn accuracy(&self) -> Option<f32> {
        if self.count > 0 {
            Some(self.correct as f32 / self.count as f32)
        } else {
            None
        }
    }
}

impl Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Stats");
        builder.field("count", &self.count);
        if let Some(loss) = self.loss.as_ref() {
            builder.field("loss", loss);
        }
        builder.field("correct", &self.correct);
        if let Some(accuracy) = self.accuracy() {
            builder.field("accuracy", &accuracy);
        }
        builder.finish()
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    /// The number of completed epochs.
    pub epoch: usize,
    /// The run time for the last epoch.
    pub epoch_time: Duration,
    /// The total run time.
    pub total_time: Duration,
    /// The training stats of the last epoch.
    pub train_stats: Stats,
    /// The validation stats of the last epoch.
    pub val_stats: Option<Stats>,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// - Times `f`.
    /// - If `f` returns `Ok((train_stats, val_stats))`, updates the stats and epoch time, and accumulates the total time and the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, f: F) -> anyhow::Result<(Stats, Option<Stats>)>
    where
        F: FnOnce(&Self) -> anyhow::Result<(Stats, Option<Stats>)>,
    {
        let start = Instant::now();
        let (train_stats, val_stats) = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train_stats = train_stats;
        self.val_stats = val_stats;
        Ok((train_stats, val_stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accuracy() {
        assert_eq!(Stats::default().accuracy(), None);
        let stats = Stats {
            count: 4,
            loss: None,
            correct: 3,
        };
        assert_eq!(stats.accuracy(), Some(0.75));
    }

    #[test]
    fn summary_run_epoch() -> anyhow::Result<()> {
        let mut summary = Summary::default();
        let stats = Stats {
            count: 2,
            loss: Some(0.5),
            correct: 1,
        };
        summary.run_epoch(|summary| {
            assert_eq!(summary.epoch, 0);
            Ok((stats, None))
        })?;
        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.train_stats.correct, 1);
        assert!(summary
            .run_epoch(|_| Err(anyhow::anyhow!("failed")))
            .is_err());
        assert_eq!(summary.epoch, 1);
        Ok(())
    }
}
