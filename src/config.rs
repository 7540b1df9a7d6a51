use crate::{
    dataset::{ClipShape, FoldFiles},
    device::Device,
    learn::neural_network::optimizer::OptimizerKind,
    result::Result,
    sweep::Sweep,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Invalid [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A count or size is 0.
    #[error("{0} must be positive!")]
    Zero(&'static str),
    /// Fewer than 2 folds.
    #[error("Expected at least 2 folds, found {0}!")]
    FoldCount(usize),
    /// A sweep entry names a decay strategy that does not exist.
    #[error("Run {id}: decay strategy {index} out of range for {count} strategies!")]
    DecayStrategy {
        /// The sweep entry.
        id: u64,
        /// The strategy index.
        index: usize,
        /// The number of strategies.
        count: usize,
    },
    /// A learning rate or weight decay is invalid.
    #[error("Run {id}: {field} {value} is invalid!")]
    Hyperparameter {
        /// The sweep entry.
        id: u64,
        /// The hyperparameter.
        field: &'static str,
        /// Its value.
        value: f32,
    },
}

/// Settings shared by every run.
///
/// Loaded once and passed by reference, fields missing from a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The number of devices batches are split across.
    pub num_devices: usize,
    /// Samples per device per batch.
    pub per_device_batch_size: usize,
    /// Threads loading clips.
    pub num_workers: usize,
    /// The directory of the manifests.
    pub dataset_root: PathBuf,
    /// The directory of the clips, relative to `dataset_root`.
    pub clips_dir: PathBuf,
    /// Fold `i` is `<dataset_root>/<fold_prefix><i>.txt`.
    pub fold_prefix: String,
    /// The number of folds.
    pub fold_count: usize,
    /// The number of classes.
    pub num_classes: usize,
    /// The shape of each sample.
    pub clip_shape: ClipShape,
    /// The network requested from the zoo.
    pub network: String,
    /// The optimizer.
    pub optimizer: OptimizerKind,
    /// Sgd momentum.
    pub momentum: f32,
    /// The learning rate multiplier at each decay epoch.
    pub lr_decay_factor: f32,
    /// Log progress every `log_interval` epochs, 0 disables.
    pub log_interval: usize,
    /// Shuffle the training samples each epoch.
    pub shuffle: bool,
    /// Seeds network initialization and shuffling.
    pub seed: Option<u64>,
    /// The cross-validation results log.
    pub results_path: PathBuf,
    /// The hold-out hyperparameter log.
    pub hyperparameter_log: PathBuf,
    /// Record per epoch scalars to `<runs_dir>/run<id>/scalars.jsonl`.
    pub record_scalars: bool,
    /// The directory of the scalar files.
    pub runs_dir: PathBuf,
    /// Hold-out training manifest, relative to `dataset_root`.
    pub train_manifest: PathBuf,
    /// Hold-out validation manifest, relative to `dataset_root`.
    pub val_manifest: PathBuf,
    /// Hold-out test manifest, relative to `dataset_root`.
    pub test_manifest: PathBuf,
    /// The runs.
    pub sweep: Sweep,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_devices: 1,
            per_device_batch_size: 1,
            num_workers: 1,
            dataset_root: PathBuf::from("."),
            clips_dir: PathBuf::from("clips"),
            fold_prefix: "foldB_".into(),
            fold_count: 5,
            num_classes: 2,
            clip_shape: ClipShape::default(),
            network: "pooled_dense".into(),
            optimizer: OptimizerKind::Sgd,
            momentum: 0.9,
            lr_decay_factor: 0.1,
            log_interval: 20,
            shuffle: true,
            seed: None,
            results_path: PathBuf::from("5FoldResults.txt"),
            hyperparameter_log: PathBuf::from("hyperparameter_search.csv"),
            record_scalars: true,
            runs_dir: PathBuf::from("runs"),
            train_manifest: PathBuf::from("train.txt"),
            val_manifest: PathBuf::from("val.txt"),
            test_manifest: PathBuf::from("test.txt"),
            sweep: Sweep::default(),
        }
    }
}

impl Config {
    /// Loads a JSON config from `path` and validates it.
    ///
    /// **Errors**
    /// The file could not be read, parsed, or is invalid.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {path:?}!"))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {path:?}!"))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {path:?}!"))?;
        Ok(config)
    }
    /// Checks the counts and the sweep.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("num_devices", self.num_devices),
            ("per_device_batch_size", self.per_device_batch_size),
            ("num_workers", self.num_workers),
            ("num_classes", self.num_classes),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        if self.clip_shape.is_empty() {
            return Err(ConfigError::Zero("clip_shape"));
        }
        if self.fold_count < 2 {
            return Err(ConfigError::FoldCount(self.fold_count));
        }
        self.sweep.validate()
    }
    /// The global batch size, `per_device_batch_size * num_devices`.
    pub fn batch_size(&self) -> usize {
        self.per_device_batch_size * self.num_devices
    }
    /// The directory of the clips.
    pub fn clips_root(&self) -> PathBuf {
        self.dataset_root.join(&self.clips_dir)
    }
    /// The manifests of `count` folds.
    pub fn fold_files(&self, count: usize) -> FoldFiles {
        FoldFiles::new(&self.dataset_root, self.fold_prefix.as_str(), count)
            .num_classes(self.num_classes)
    }
    /// The devices.
    pub fn devices(&self) -> Result<Vec<Device>> {
        Device::list(self.num_devices)
    }
}

/// The settings of one run.
///
/// Built from a sweep entry and the [`Config`], see [`Sweep::run_configs()`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// The sweep entry id.
    pub execution_id: u64,
    /// The network requested from the zoo.
    pub network: String,
    /// The optimizer.
    pub optimizer: OptimizerKind,
    /// The initial learning rate.
    pub learning_rate: f32,
    /// The weight decay.
    pub weight_decay: f32,
    /// The number of epochs.
    pub epochs: usize,
    /// Epochs at which the learning rate decays.
    pub lr_decay_epochs: Vec<usize>,
    /// The number of folds.
    pub fold_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.fold_count, 5);
        assert_eq!(config.clip_shape.frames, 64);
        assert_eq!(config.clips_root(), Path::new("./clips"));
        assert_eq!(
            config.fold_files(config.fold_count).fold_path(2),
            Path::new("./foldB_2.txt")
        );
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_takes_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "num_devices": 2, "per_device_batch_size": 4, "optimizer": "adam" }"#,
        )?;
        let config = Config::from_path(&path)?;
        assert_eq!(config.batch_size(), 8);
        assert_eq!(config.optimizer, OptimizerKind::Adam);
        assert_eq!(config.fold_prefix, "foldB_");
        assert_eq!(config.sweep, Sweep::default());
        Ok(())
    }

    #[test]
    fn invalid_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "fold_count": 1 }"#)?;
        let error = Config::from_path(&path).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ConfigError>(),
            Some(ConfigError::FoldCount(1))
        ));
        assert!(Config::from_path(&dir.path().join("missing.json")).is_err());
        Ok(())
    }

    #[test]
    fn zero_devices() {
        let config = Config {
            num_devices: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("num_devices"))
        ));
    }
}
