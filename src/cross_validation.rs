use crate::{
    config::{Config, RunConfig},
    dataset::{ClipLoader, DataLoader, Dataset, FoldSplit},
    device::Device,
    learn::{
        metric::ConfusionMatrix,
        neural_network::{ModelZoo, Network, Trainer},
        train::TrainingLoop,
    },
    recorder::{FoldResultsLog, JsonlScalarSink, NullSink, ScalarSink},
    result::Result,
};
use anyhow::{anyhow, ensure};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info};

/// The outcome of one fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    /// The held out fold.
    pub fold_index: usize,
    /// Accuracy on the held out fold.
    pub test_accuracy: f32,
    /// Test labels vs predictions.
    pub confusion_matrix: ConfusionMatrix,
}

/// The outcome of a cross-validated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// The sweep entry id.
    pub execution_id: u64,
    /// The mean of the fold accuracies.
    pub mean_test_accuracy: f32,
    /// The folds, in order.
    pub folds: Vec<FoldResult>,
}

/// The arithmetic mean, None if `accuracies` is empty.
pub fn mean_accuracy(accuracies: &[f32]) -> Option<f32> {
    if accuracies.is_empty() {
        None
    } else {
        Some(accuracies.iter().sum::<f32>() / accuracies.len() as f32)
    }
}

/// The network and trainer of one fold.
///
/// Dropping the session releases the network and empties the caches of every device, so nothing
/// allocated for a fold outlives it.
struct FoldSession<'a> {
    network: Box<dyn Network>,
    trainer: Trainer,
    devices: &'a [Device],
}

impl Drop for FoldSession<'_> {
    fn drop(&mut self) {
        for device in self.devices {
            device.empty_cache();
        }
        debug!(devices = self.devices.len(), "released fold session");
    }
}

/// Runs k-fold cross-validation.
///
/// Each fold trains a fresh network on every other fold and tests on the held out fold. Runs are
/// appended to the fold results log.
pub struct CrossValidation<'a> {
    config: &'a Config,
    zoo: &'a dyn ModelZoo,
    loader: Arc<dyn ClipLoader>,
    devices: Vec<Device>,
    pool: Arc<ThreadPool>,
    log: FoldResultsLog,
}

impl<'a> CrossValidation<'a> {
    /// Creates a new [`CrossValidation`].
    ///
    /// **Errors**
    /// - `config` is invalid.
    /// - The shape of `loader` is not `config.clip_shape`.
    /// - The loader thread pool could not be created.
    pub fn new(
        config: &'a Config,
        zoo: &'a dyn ModelZoo,
        loader: Arc<dyn ClipLoader>,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            loader.shape() == config.clip_shape,
            "Loader shape {:?} does not match config {:?}!",
            loader.shape(),
            config.clip_shape
        );
        let devices = config.devices()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .thread_name(|i| format!("clip-loader-{i}"))
            .build()?;
        Ok(Self {
            config,
            zoo,
            loader,
            devices,
            pool: Arc::new(pool),
            log: FoldResultsLog::new(&config.results_path),
        })
    }
    /// The devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
    /// The fold results log.
    pub fn log(&self) -> &FoldResultsLog {
        &self.log
    }
    /// Cross-validates `run` over `run.fold_count` folds, in order.
    ///
    /// `on_fold` is called after each fold. The result is appended to the log once every fold has
    /// completed.
    ///
    /// **Errors**
    /// - The folds do not partition the dataset.
    /// - A fold has no test clips.
    /// - Training failed.
    pub fn run(
        &self,
        run: &RunConfig,
        mut on_fold: impl FnMut(&FoldResult),
    ) -> Result<RunResult> {
        let start = Instant::now();
        info!(
            run = run.execution_id,
            folds = run.fold_count,
            epochs = run.epochs,
            learning_rate = run.learning_rate,
            weight_decay = run.weight_decay,
            started = %chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            "cross-validation"
        );
        let fold_files = self.config.fold_files(run.fold_count);
        fold_files.verify_partition()?;
        let mut folds = Vec::with_capacity(run.fold_count);
        for index in 0..run.fold_count {
            let fold = self.run_fold(run, fold_files.split(index)?)?;
            info!(
                run = run.execution_id,
                fold = index,
                accuracy = fold.test_accuracy,
                "fold"
            );
            on_fold(&fold);
            folds.push(fold);
        }
        let accuracies: Vec<f32> = folds.iter().map(|x| x.test_accuracy).collect();
        let mean_test_accuracy =
            mean_accuracy(&accuracies).ok_or_else(|| anyhow!("Expected at least 1 fold!"))?;
        let result = RunResult {
            execution_id: run.execution_id,
            mean_test_accuracy,
            folds,
        };
        self.log.append_run(&result)?;
        info!(
            run = run.execution_id,
            accuracy = mean_test_accuracy,
            elapsed = ?start.elapsed(),
            "final"
        );
        Ok(result)
    }
    fn session(&self, run: &RunConfig) -> Result<FoldSession<'_>> {
        let network = self.zoo.get_model(&run.network, self.config.num_classes)?;
        let optimizer = run.optimizer.build(run.weight_decay, self.config.momentum);
        let trainer = Trainer::new(optimizer, run.learning_rate)?;
        Ok(FoldSession {
            network,
            trainer,
            devices: &self.devices,
        })
    }
    fn scalar_sink(&self, run: &RunConfig, index: usize) -> Result<Box<dyn ScalarSink>> {
        if self.config.record_scalars {
            let id = run.execution_id * 100 + index as u64;
            Ok(Box::new(JsonlScalarSink::create(&self.config.runs_dir, id)?))
        } else {
            Ok(Box::new(NullSink))
        }
    }
    fn run_fold(&self, run: &RunConfig, split: FoldSplit) -> Result<FoldResult> {
        let FoldSplit { index, train, test } = split;
        ensure!(!test.is_empty(), "Fold {index} has no test clips!");
        debug!(
            fold = index,
            train = train.len(),
            test = test.len(),
            "split"
        );
        let config = self.config;
        let batch_size = config.batch_size();
        let clips_root = config.clips_root();
        let train = DataLoader::with_pool(
            Dataset::new(&clips_root, train, self.loader.clone()),
            batch_size,
            self.pool.clone(),
        )
        .shuffle(config.shuffle)
        .seed(config.seed.map(|seed| seed.wrapping_add(index as u64)));
        let test = DataLoader::with_pool(
            Dataset::new(clips_root, test, self.loader.clone()),
            batch_size,
            self.pool.clone(),
        );
        let mut sink = self.scalar_sink(run, index)?;
        let metrics = {
            let mut session = self.session(run)?;
            let FoldSession {
                network, trainer, ..
            } = &mut session;
            TrainingLoop::new(&self.devices, sink.as_mut())
                .log_interval(config.log_interval)
                .lr_decay_factor(config.lr_decay_factor)
                .run(run, &mut **network, trainer, &train, None, &test)?
        };
        let test_accuracy = metrics
            .test_accuracy
            .ok_or_else(|| anyhow!("Fold {index} has no test predictions!"))?;
        let confusion_matrix = ConfusionMatrix::from_labels_predictions(
            &metrics.labels,
            &metrics.predictions,
            config.num_classes,
        )?;
        Ok(FoldResult {
            fold_index: index,
            test_accuracy,
            confusion_matrix,
        })
    }
}

/// Cross-validates `run` with a new [`CrossValidation`].
pub fn run_k_fold(
    config: &Config,
    zoo: &dyn ModelZoo,
    loader: Arc<dyn ClipLoader>,
    run: &RunConfig,
) -> Result<RunResult> {
    CrossValidation::new(config, zoo, loader)?.run(run, |_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{ClipShape, SyntheticLoader},
        learn::neural_network::BuiltinZoo,
    };
    use approx::assert_relative_eq;
    use std::{fs, path::Path};
    use tempfile::tempdir;

    #[test]
    fn mean_of_fold_accuracies() {
        assert_relative_eq!(
            mean_accuracy(&[0.6, 0.7, 0.8, 0.5, 0.9]).unwrap(),
            0.7,
            epsilon = 1e-6
        );
        assert_eq!(mean_accuracy(&[]), None);
    }

    fn config(root: &Path) -> Config {
        Config {
            dataset_root: root.to_owned(),
            clip_shape: ClipShape {
                clips: 1,
                frames: 2,
                channels: 3,
                height: 2,
                width: 2,
            },
            num_devices: 2,
            record_scalars: false,
            seed: Some(0),
            fold_count: 3,
            results_path: root.join("5FoldResults.txt"),
            ..Config::default()
        }
    }

    fn write_folds(root: &Path, folds: &[&str]) -> Result<()> {
        for (i, fold) in folds.iter().enumerate() {
            fs::write(root.join(format!("foldB_{i}.txt")), fold)?;
        }
        Ok(())
    }

    fn run_config(config: &Config) -> Result<RunConfig> {
        let mut run = config.sweep.run_configs(config)?.remove(0);
        run.epochs = 2;
        Ok(run)
    }

    #[test]
    fn runs_folds_in_order() -> Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        write_folds(
            dir.path(),
            &["a.mp4 0\nb.mp4 1\n", "c.mp4 0\nd.mp4 1\n", "e.mp4 1\n"],
        )?;
        let zoo = BuiltinZoo::new(3).seed(Some(0));
        let loader = Arc::new(SyntheticLoader::new(config.clip_shape));
        let cross_validation = CrossValidation::new(&config, &zoo, loader)?;
        let mut seen = Vec::new();
        let result = cross_validation.run(&run_config(&config)?, |fold| seen.push(fold.fold_index))?;
        assert_eq!(seen, [0, 1, 2]);
        assert_eq!(result.execution_id, 8);
        assert_eq!(result.folds[2].confusion_matrix.counts().sum(), 1);
        let accuracies: Vec<f32> = result.folds.iter().map(|x| x.test_accuracy).collect();
        assert_relative_eq!(result.mean_test_accuracy, mean_accuracy(&accuracies).unwrap());
        assert!(dir.path().join("train_with_foldB_1_as_test.txt").exists());
        assert!(cross_validation
            .devices()
            .iter()
            .all(|device| device.cached_bytes() == 0));
        let log = fs::read_to_string(cross_validation.log().path())?;
        assert!(log.starts_with("\nRun 800\n------Fold 0 | Acuracia: "));
        Ok(())
    }

    #[test]
    fn empty_fold_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        write_folds(dir.path(), &["a.mp4 0\n", "b.mp4 1\n", "\n"])?;
        let zoo = BuiltinZoo::new(3);
        let loader = Arc::new(SyntheticLoader::new(config.clip_shape));
        let error = run_k_fold(&config, &zoo, loader, &run_config(&config)?).unwrap_err();
        assert!(error.to_string().contains("no test clips"));
        assert!(!config.results_path.exists());
        Ok(())
    }

    #[test]
    fn overlapping_folds_are_an_error() -> Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        write_folds(dir.path(), &["a.mp4 0\n", "a.mp4 0\n", "b.mp4 1\n"])?;
        let zoo = BuiltinZoo::new(3);
        let loader = Arc::new(SyntheticLoader::new(config.clip_shape));
        assert!(run_k_fold(&config, &zoo, loader, &run_config(&config)?).is_err());
        Ok(())
    }

    #[test]
    fn fold_files_follow_config_and_run() -> Result<()> {
        let dir = tempdir()?;
        let config = Config {
            fold_prefix: "split_".into(),
            ..config(dir.path())
        };
        fs::write(dir.path().join("split_0.txt"), "a.mp4 0\nb.mp4 1\n")?;
        fs::write(dir.path().join("split_1.txt"), "c.mp4 1\nd.mp4 0\n")?;
        let zoo = BuiltinZoo::new(3);
        let loader = Arc::new(SyntheticLoader::new(config.clip_shape));
        let cross_validation = CrossValidation::new(&config, &zoo, loader)?;
        let mut run = run_config(&config)?;
        run.fold_count = 2;
        let result = cross_validation.run(&run, |_| ())?;
        assert_eq!(result.folds.len(), 2);
        assert!(dir.path().join("train_with_split_1_as_test.txt").exists());
        // labels are checked against config.num_classes
        fs::write(dir.path().join("split_1.txt"), "c.mp4 2\n")?;
        assert!(cross_validation.run(&run, |_| ()).is_err());
        Ok(())
    }

    #[test]
    fn loader_shape_must_match() {
        let config = Config::default();
        let zoo = BuiltinZoo::new(3);
        let loader = Arc::new(SyntheticLoader::new(ClipShape {
            frames: 1,
            ..config.clip_shape
        }));
        assert!(CrossValidation::new(&config, &zoo, loader).is_err());
    }
}
