use crate::{
    cross_validation::RunResult, learn::neural_network::optimizer::OptimizerKind,
    result::Result,
};
use anyhow::Context;
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|x| !x.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {path:?}!"))
}

fn format_accuracy(accuracy: Option<f32>) -> String {
    accuracy.map_or_else(|| "nan".to_string(), |x| x.to_string())
}

/// A row of the [`HyperparameterLog`].
#[derive(Debug, Clone)]
pub struct HyperparameterRow<'a> {
    /// The run.
    pub execution_id: u64,
    /// The initial learning rate.
    pub learning_rate: f32,
    /// The decay epochs.
    pub lr_decay_strategy: &'a [usize],
    /// The optimizer.
    pub optimizer: OptimizerKind,
    /// The weight decay.
    pub weight_decay: f32,
    /// The network name.
    pub network: &'a str,
    /// The number of epochs.
    pub epochs: usize,
    /// Training accuracy of the last epoch.
    pub training_acc: Option<f32>,
    /// Validation accuracy after the last epoch.
    pub val_acc: Option<f32>,
}

impl HyperparameterRow<'_> {
    fn fields(&self) -> [String; 9] {
        let strategy = self
            .lr_decay_strategy
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        [
            self.execution_id.to_string(),
            self.learning_rate.to_string(),
            format!("[{strategy}]"),
            self.optimizer.to_string(),
            self.weight_decay.to_string(),
            self.network.to_string(),
            self.epochs.to_string(),
            format_accuracy(self.training_acc),
            format_accuracy(self.val_acc),
        ]
    }
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Tabular log of hold-out runs.
///
/// Rows are appended, the header is written when the file is new or empty.
#[derive(Debug, Clone)]
pub struct HyperparameterLog {
    path: PathBuf,
}

impl HyperparameterLog {
    /// The columns.
    pub const HEADER: [&'static str; 9] = [
        "execution_id",
        "learning_rate",
        "lr_decay_strategy",
        "optimizer",
        "wd",
        "network",
        "epochs",
        "training_acc",
        "val_acc",
    ];
    /// Creates a log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
    /// The path of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// Appends `row`.
    pub fn append_row(&self, row: &HyperparameterRow) -> Result<()> {
        let mut file = open_append(&self.path)?;
        let mut text = String::new();
        if file.metadata()?.len() == 0 {
            text.push_str(&Self::HEADER.join(","));
            text.push('\n');
        }
        let fields: Vec<String> = row.fields().iter().map(|x| csv_field(x)).collect();
        text.push_str(&fields.join(","));
        text.push('\n');
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Plain text log of cross-validated runs.
#[derive(Debug, Clone)]
pub struct FoldResultsLog {
    path: PathBuf,
}

impl FoldResultsLog {
    /// Creates a log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
    /// The path of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// Formats the block for `result`.
    ///
    /// ```text
    ///
    /// Run 800
    /// ------Fold 0 | Acuracia: 0.5
    /// [[1 0]
    ///  [1 0]]
    /// ...
    /// ACURACIA FINAL: 0.6
    /// ```
    pub fn format_run(result: &RunResult) -> String {
        let mut text = format!("\nRun {}\n", result.execution_id * 100);
        for fold in result.folds.iter() {
            text.push_str(&format!(
                "------Fold {} | Acuracia: {}\n{}\n",
                fold.fold_index, fold.test_accuracy, fold.confusion_matrix
            ));
        }
        text.push_str(&format!("ACURACIA FINAL: {}\n", result.mean_test_accuracy));
        text
    }
    /// Appends the block for `result` in one write.
    pub fn append_run(&self, result: &RunResult) -> Result<()> {
        let mut file = open_append(&self.path)?;
        file.write_all(Self::format_run(result).as_bytes())?;
        Ok(())
    }
}

/// Receives per epoch scalars, ie accuracy curves.
pub trait ScalarSink {
    /// Records `value` for `tag` at `step`.
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()>;
    /// Flushes buffered records.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards scalars.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ScalarSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f32, _step: usize) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    run: u64,
    tag: &'a str,
    step: usize,
    value: f32,
    wall_time: f64,
}

/// Writes scalars as JSON lines to `<runs_dir>/run<id>/scalars.jsonl`.
pub struct JsonlScalarSink {
    run: u64,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlScalarSink {
    /// Creates or appends to the scalar file of `run`.
    pub fn create(runs_dir: &Path, run: u64) -> Result<Self> {
        let path = runs_dir.join(format!("run{run}")).join("scalars.jsonl");
        let writer = BufWriter::new(open_append(&path)?);
        Ok(Self { run, path, writer })
    }
    /// The path of the scalar file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for JsonlScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let record = ScalarRecord {
            run: self.run,
            tag,
            step,
            value,
            wall_time: chrono::Utc::now().timestamp_millis() as f64 / 1000.,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlScalarSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("Failed to flush {:?}: {e}", self.path);
        }
    }
}
