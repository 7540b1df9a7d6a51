use anyhow::{Context, Result};
use clap::Parser;
use deception_cv::{
    config::Config,
    cross_validation::CrossValidation,
    dataset::{ClipLoader, SyntheticLoader},
    holdout::run_holdout,
    learn::neural_network::BuiltinZoo,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Cross-validated training of a deception detection video classifier.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// JSON config. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Only cross-validate the sweep entry with this id.
    #[arg(long, conflicts_with = "holdout")]
    run: Option<u64>,
    /// Train the sweep entry with this id on the train / val / test manifests instead of
    /// cross-validating.
    #[arg(long)]
    holdout: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = match cli.config.as_ref() {
        Some(path) => Config::from_path(path)?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };
    let zoo = BuiltinZoo::new(config.clip_shape.channels).seed(config.seed);
    warn!("No video decoder is linked, clips are synthetic.");
    let loader: Arc<dyn ClipLoader> = Arc::new(SyntheticLoader::new(config.clip_shape));

    if let Some(id) = cli.holdout {
        let entry = config
            .sweep
            .entry(id)
            .with_context(|| format!("Sweep has no run {id}!"))?;
        let run = config.sweep.run_config(&config, entry)?;
        let metrics = run_holdout(&config, &zoo, loader, &run)?;
        info!(
            run = id,
            train = ?metrics.train_accuracy,
            val = ?metrics.val_accuracy,
            test = ?metrics.test_accuracy,
            "done"
        );
        return Ok(());
    }

    let runs = match cli.run {
        Some(id) => {
            let entry = config
                .sweep
                .entry(id)
                .with_context(|| format!("Sweep has no run {id}!"))?;
            vec![config.sweep.run_config(&config, entry)?]
        }
        None => config.sweep.run_configs(&config)?,
    };
    let cross_validation = CrossValidation::new(&config, &zoo, loader)?;
    let folds: usize = runs.iter().map(|run| run.fold_count).sum();
    let style = ProgressStyle::default_bar()
        .template("{msg} [{bar}] {pos:>3}/{len:3} [eta: {eta}]")?
        .progress_chars("=> ");
    let bar = ProgressBar::new(folds as u64).with_style(style);
    for run in runs.iter() {
        bar.set_message(format!("run {}", run.execution_id));
        let result = cross_validation.run(run, |fold| {
            bar.inc(1);
            bar.println(format!(
                "run {} fold {}: {}",
                run.execution_id, fold.fold_index, fold.test_accuracy
            ));
        })?;
        bar.println(format!(
            "run {} ACURACIA FINAL: {}",
            result.execution_id, result.mean_test_accuracy
        ));
    }
    bar.finish();
    info!(
        log = ?cross_validation.log().path(),
        runs = runs.len(),
        "sweep complete"
    );
    Ok(())
}
