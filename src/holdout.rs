use crate::{
    config::{Config, RunConfig},
    dataset::{ClipLoader, DataLoader, Dataset, Manifest},
    learn::{
        neural_network::{ModelZoo, Trainer},
        train::{FinalMetrics, TrainingLoop},
    },
    recorder::{HyperparameterLog, HyperparameterRow, JsonlScalarSink, NullSink, ScalarSink},
    result::Result,
};
use anyhow::ensure;
use std::{path::Path, sync::Arc};
use tracing::info;

/// Trains `run` on the hold-out train manifest with validation, tests on the test manifest and
/// appends a row to the hyperparameter log.
///
/// Manifests are read from `config.dataset_root`. Only Sgd uses momentum.
///
/// **Errors**
/// - `config` is invalid, or the loader shape does not match.
/// - A manifest could not be loaded, or the test manifest is empty.
/// - Training failed.
pub fn run_holdout(
    config: &Config,
    zoo: &dyn ModelZoo,
    loader: Arc<dyn ClipLoader>,
    run: &RunConfig,
) -> Result<FinalMetrics> {
    config.validate()?;
    ensure!(
        loader.shape() == config.clip_shape,
        "Loader shape {:?} does not match config {:?}!",
        loader.shape(),
        config.clip_shape
    );
    let load = |path: &Path| Manifest::from_path(&config.dataset_root.join(path), config.num_classes);
    let train = load(&config.train_manifest)?;
    let val = load(&config.val_manifest)?;
    let test = load(&config.test_manifest)?;
    ensure!(!test.is_empty(), "Test manifest has no clips!");
    info!(
        run = run.execution_id,
        train = train.len(),
        val = val.len(),
        test = test.len(),
        "hold-out"
    );
    let batch_size = config.batch_size();
    let clips_root = config.clips_root();
    let data_loader = |manifest, shuffle: bool| -> Result<DataLoader> {
        Ok(DataLoader::new(
            Dataset::new(&clips_root, manifest, loader.clone()),
            batch_size,
            config.num_workers,
        )?
        .shuffle(shuffle)
        .seed(config.seed))
    };
    let train = data_loader(train, config.shuffle)?;
    let val = data_loader(val, false)?;
    let test = data_loader(test, false)?;
    let devices = config.devices()?;
    let mut network = zoo.get_model(&run.network, config.num_classes)?;
    let optimizer = run.optimizer.build(run.weight_decay, config.momentum);
    let mut trainer = Trainer::new(optimizer, run.learning_rate)?;
    let mut sink: Box<dyn ScalarSink> = if config.record_scalars {
        Box::new(JsonlScalarSink::create(&config.runs_dir, run.execution_id)?)
    } else {
        Box::new(NullSink)
    };
    let metrics = TrainingLoop::new(&devices, sink.as_mut())
        .log_interval(config.log_interval)
        .lr_decay_factor(config.lr_decay_factor)
        .run(
            run,
            &mut *network,
            &mut trainer,
            &train,
            (!val.dataset().is_empty()).then_some(&val),
            &test,
        )?;
    info!(
        run = run.execution_id,
        test = ?metrics.test_accuracy,
        "hold-out test"
    );
    HyperparameterLog::new(&config.hyperparameter_log).append_row(&HyperparameterRow {
        execution_id: run.execution_id,
        learning_rate: run.learning_rate,
        lr_decay_strategy: &run.lr_decay_epochs,
        optimizer: run.optimizer,
        weight_decay: run.weight_decay,
        network: &run.network,
        epochs: run.epochs,
        training_acc: metrics.train_accuracy,
        val_acc: metrics.val_accuracy,
    })?;
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{ClipShape, SyntheticLoader},
        learn::neural_network::{optimizer::OptimizerKind, BuiltinZoo},
    };
    use std::fs;
    use tempfile::tempdir;

    fn config(root: &Path) -> Config {
        Config {
            dataset_root: root.to_owned(),
            clip_shape: ClipShape {
                clips: 2,
                frames: 1,
                channels: 3,
                height: 2,
                width: 2,
            },
            per_device_batch_size: 2,
            optimizer: OptimizerKind::Adam,
            seed: Some(1),
            hyperparameter_log: root.join("hyperparameter_search.csv"),
            runs_dir: root.join("runs"),
            ..Config::default()
        }
    }

    #[test]
    fn appends_csv_row() -> Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        fs::write(dir.path().join("train.txt"), "a.mp4 0\nb.mp4 1\nc.mp4 0\n")?;
        fs::write(dir.path().join("val.txt"), "d.mp4 1\n")?;
        fs::write(dir.path().join("test.txt"), "e.mp4 0\nf.mp4 1\n")?;
        let zoo = BuiltinZoo::new(3).seed(Some(0));
        let loader = Arc::new(SyntheticLoader::new(config.clip_shape));
        let mut run = config.sweep.run_configs(&config)?.remove(1);
        run.epochs = 2;
        let metrics = run_holdout(&config, &zoo, loader, &run)?;
        assert_eq!(metrics.labels.len(), 2);
        assert!(metrics.val_accuracy.is_some());
        let csv = fs::read_to_string(&config.hyperparameter_log)?;
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("11,0.0005,"));
        assert!(lines[1].contains(",adam,"));
        let scalars = fs::read_to_string(config.runs_dir.join("run11").join("scalars.jsonl"))?;
        assert_eq!(scalars.lines().count(), 4);
        Ok(())
    }

    #[test]
    fn missing_manifest() -> Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        let zoo = BuiltinZoo::new(3);
        let loader = Arc::new(SyntheticLoader::new(config.clip_shape));
        let run = config.sweep.run_configs(&config)?.remove(0);
        assert!(run_holdout(&config, &zoo, loader, &run).is_err());
        assert!(!config.hyperparameter_log.exists());
        Ok(())
    }
}
