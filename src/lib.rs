/*!
# deception-cv

Cross-validated training of a binary video classifier that separates truthful (0) from deceptive (1)
speech in short clips.

The crate drives training; it does not decode video or define a production architecture. Those are
supplied through [`ClipLoader`](dataset::ClipLoader) and [`ModelZoo`](learn::neural_network::ModelZoo).
A [`SyntheticLoader`](dataset::SyntheticLoader) and a small built in network
([`PooledDense`](learn::neural_network::PooledDense)) make the driver runnable on its own.

# Example
```no_run
use deception_cv::{
    config::Config,
    cross_validation::CrossValidation,
    dataset::SyntheticLoader,
    learn::neural_network::BuiltinZoo,
};
use std::sync::Arc;

# fn main() -> anyhow::Result<()> {
let config = Config::default();
let zoo = BuiltinZoo::new(config.clip_shape.channels);
let loader = Arc::new(SyntheticLoader::new(config.clip_shape));
let cross_validation = CrossValidation::new(&config, &zoo, loader)?;
for run in config.sweep.run_configs(&config)? {
    let result = cross_validation.run(&run, |_| ())?;
    println!("{} {}", result.execution_id, result.mean_test_accuracy);
}
# Ok(())
# }
```
*/

/// Configuration.
pub mod config;
/// K-fold cross-validation.
pub mod cross_validation;
/// Datasets and loading.
pub mod dataset;
/// Compute contexts.
pub mod device;
/// Hold-out (train / val / test) runs.
pub mod holdout;
/// Training and evaluation.
pub mod learn;
/// Result logs.
pub mod recorder;
/// Hyperparameter sweeps.
pub mod sweep;

/// Result type.
pub mod result {
    /// Result type, see [`anyhow::Result`].
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}
