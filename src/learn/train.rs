use super::{
    criterion::{argmax, Criterion, CrossEntropyLoss},
    metric::Accuracy,
    neural_network::{Network, Trainer},
    schedule::LrSchedule,
    Stats, Summary,
};
use crate::{
    config::RunConfig,
    dataset::{Batch, DataLoader},
    device::Device,
    recorder::ScalarSink,
    result::Result,
};
use anyhow::ensure;
use ndarray::{Array1, Array2, ArrayView1, ArrayView5};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Results of [`TrainingLoop::run()`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalMetrics {
    /// Training accuracy of the last epoch.
    pub train_accuracy: Option<f32>,
    /// Validation accuracy, accumulated over every epoch.
    pub val_accuracy: Option<f32>,
    /// Test accuracy.
    pub test_accuracy: Option<f32>,
    /// Mean training loss per batch of the last epoch.
    pub train_loss: Option<f32>,
    /// Test labels, in batch order.
    pub labels: Vec<u32>,
    /// Test predictions, aligned with `labels`.
    pub predictions: Vec<u32>,
    /// Timing and stats of the last epoch.
    pub summary: Summary,
}

/// Averages the logits of each sample's clips.
///
/// Rows `[i * clip_count, (i + 1) * clip_count)` belong to sample `i`.
fn clip_consensus(logits: Array2<f32>, clip_count: usize) -> Result<Array2<f32>> {
    if clip_count == 1 {
        return Ok(logits);
    }
    let (rows, classes) = logits.dim();
    ensure!(
        clip_count > 0 && rows % clip_count == 0,
        "Expected a multiple of {clip_count} rows, found {rows}!"
    );
    let scale = 1. / clip_count as f32;
    Ok(Array2::from_shape_fn(
        (rows / clip_count, classes),
        |(i, j)| {
            (0..clip_count)
                .map(|c| logits[[i * clip_count + c, j]])
                .sum::<f32>()
                * scale
        },
    ))
}

/// Distributes the gradient of averaged logits back to each clip.
fn expand_consensus_grad(grad: Array2<f32>, clip_count: usize) -> Array2<f32> {
    if clip_count == 1 {
        return grad;
    }
    let (samples, classes) = grad.dim();
    let scale = 1. / clip_count as f32;
    Array2::from_shape_fn((samples * clip_count, classes), |(r, j)| {
        grad[[r / clip_count, j]] * scale
    })
}

/// Forward, loss and backward for one shard.
///
/// Returns the mean loss and the predictions.
fn train_shard(
    network: &mut dyn Network,
    input: ArrayView5<f32>,
    labels: ArrayView1<u32>,
    clip_count: usize,
) -> Result<(f32, Array1<u32>)> {
    let logits = clip_consensus(network.forward(input)?, clip_count)?;
    let (loss, grad) = CrossEntropyLoss.eval(logits.view(), labels)?;
    let grad = expand_consensus_grad(grad, clip_count);
    network.backward(input, grad.view())?;
    Ok((loss.mean().unwrap_or(0.), argmax(logits.view())))
}

fn accuracy_stats(accuracy: &Accuracy, loss: Option<f32>) -> Stats {
    Stats {
        count: accuracy.total(),
        loss,
        correct: accuracy.correct(),
    }
}

/// Trains and evaluates a network on one split.
///
/// Each batch is split across `devices` in order, see [`Batch::shards()`].
pub struct TrainingLoop<'a> {
    devices: &'a [Device],
    sink: &'a mut dyn ScalarSink,
    log_interval: usize,
    lr_decay_factor: f32,
}

impl<'a> TrainingLoop<'a> {
    /// Creates a training loop over `devices`, reporting per epoch scalars to `sink`.
    pub fn new(devices: &'a [Device], sink: &'a mut dyn ScalarSink) -> Self {
        Self {
            devices,
            sink,
            log_interval: 20,
            lr_decay_factor: 0.1,
        }
    }
    /// Logs every `log_interval` epochs. Defaults to 20, 0 disables.
    pub fn log_interval(self, log_interval: usize) -> Self {
        Self {
            log_interval,
            ..self
        }
    }
    /// The learning rate multiplier at each decay epoch. Defaults to 0.1.
    pub fn lr_decay_factor(self, lr_decay_factor: f32) -> Self {
        Self {
            lr_decay_factor,
            ..self
        }
    }
    /// Trains `network` for `run.epochs` on `train`, evaluating on `val` after each epoch, and
    /// then tests on `test`.
    ///
    /// **Errors**
    /// Any failure (loading, shape mismatch, ...) aborts the run.
    pub fn run(
        &mut self,
        run: &RunConfig,
        network: &mut dyn Network,
        trainer: &mut Trainer,
        train: &DataLoader,
        val: Option<&DataLoader>,
        test: &DataLoader,
    ) -> Result<FinalMetrics> {
        ensure!(!self.devices.is_empty(), "Expected at least 1 device!");
        let mut schedule =
            LrSchedule::new(run.lr_decay_epochs.clone()).factor(self.lr_decay_factor);
        let mut summary = Summary::default();
        let mut train_accuracy = Accuracy::default();
        let mut val_accuracy = Accuracy::default();
        for epoch in 0..run.epochs {
            let learning_rate = schedule.step(epoch, trainer.learning_rate());
            if learning_rate != trainer.learning_rate() {
                debug!(run = run.execution_id, epoch, learning_rate, "decay");
                trainer.set_learning_rate(learning_rate);
            }
            let (train_stats, val_stats) = summary.run_epoch(|_| {
                train_accuracy.reset();
                let mut loss = 0.;
                let mut batches = 0;
                for batch in train.iter() {
                    loss += self.train_batch(network, trainer, &batch?, &mut train_accuracy)?;
                    batches += 1;
                }
                let loss = (batches > 0).then(|| loss / batches as f32);
                let train_stats = accuracy_stats(&train_accuracy, loss);
                let val_stats = match val {
                    Some(val) => {
                        self.evaluate(network, val, &mut val_accuracy)?;
                        Some(accuracy_stats(&val_accuracy, None))
                    }
                    None => None,
                };
                Ok((train_stats, val_stats))
            })?;
            if let Some(accuracy) = train_stats.accuracy() {
                self.sink.add_scalar("Accuracy/train", accuracy, epoch)?;
            }
            if let Some(accuracy) = val_stats.and_then(|x| x.accuracy()) {
                self.sink.add_scalar("Accuracy/val", accuracy, epoch)?;
            }
            if self.log_interval > 0 && epoch % self.log_interval == 0 {
                info!(
                    run = run.execution_id,
                    epoch,
                    train = ?train_stats.accuracy(),
                    val = ?val_stats.and_then(|x| x.accuracy()),
                    loss = ?train_stats.loss,
                    time = ?summary.epoch_time,
                    "epoch"
                );
            }
        }
        self.sink.flush()?;
        let mut test_accuracy = Accuracy::default();
        let (labels, predictions) = self.evaluate(network, test, &mut test_accuracy)?;
        Ok(FinalMetrics {
            train_accuracy: train_accuracy.get(),
            val_accuracy: val.and(val_accuracy.get()),
            test_accuracy: test_accuracy.get(),
            train_loss: summary.train_stats.loss,
            labels,
            predictions,
            summary,
        })
    }
    /// Trains on one batch, stepping the trainer once with the number of samples in the batch.
    ///
    /// A short last batch is averaged over its own samples.
    ///
    /// Returns the sum over shards of the mean shard loss.
    fn train_batch(
        &self,
        network: &mut dyn Network,
        trainer: &Trainer,
        batch: &Batch,
        accuracy: &mut Accuracy,
    ) -> Result<f32> {
        let clip_count = batch.clip_count();
        let mut loss = 0.;
        let shards = batch.shards(self.devices.len());
        for ((clips, labels), device) in shards.into_iter().zip(self.devices) {
            let input = device.stage_clips(clips)?;
            let output = train_shard(network, input.view(), labels, clip_count);
            device.recycle(input.into_raw_vec());
            let (shard_loss, predictions) = output?;
            loss += shard_loss;
            accuracy.update(&labels.to_vec(), &predictions.to_vec())?;
        }
        trainer.step(network, batch.len())?;
        Ok(loss)
    }
    /// Forward only pass over `loader`, shards computed in parallel.
    ///
    /// Returns the labels and predictions in batch order.
    fn evaluate(
        &self,
        network: &dyn Network,
        loader: &DataLoader,
        accuracy: &mut Accuracy,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut labels = Vec::with_capacity(loader.dataset().len());
        let mut predictions = Vec::with_capacity(loader.dataset().len());
        for batch in loader.iter() {
            let batch = batch?;
            let clip_count = batch.clip_count();
            let shard_predictions = batch
                .shards(self.devices.len())
                .into_par_iter()
                .zip(self.devices.par_iter())
                .map(|((clips, _), device)| -> Result<Array1<u32>> {
                    let input = device.stage_clips(clips)?;
                    let logits = network.forward(input.view());
                    device.recycle(input.into_raw_vec());
                    let logits = clip_consensus(logits?, clip_count)?;
                    Ok(argmax(logits.view()))
                })
                .collect::<Result<Vec<_>>>()?;
            let batch_labels = batch.labels.to_vec();
            let batch_predictions: Vec<u32> = shard_predictions
                .into_iter()
                .flat_map(Array1::into_raw_vec)
                .collect();
            accuracy.update(&batch_labels, &batch_predictions)?;
            labels.extend(batch_labels);
            predictions.extend(batch_predictions);
        }
        Ok((labels, predictions))
    }
}

/// Runs the [`TrainingLoop`] with its defaults.
#[allow(clippy::too_many_arguments)]
pub fn run_training(
    run: &RunConfig,
    devices: &[Device],
    sink: &mut dyn ScalarSink,
    network: &mut dyn Network,
    trainer: &mut Trainer,
    train: &DataLoader,
    val: Option<&DataLoader>,
    test: &DataLoader,
) -> Result<FinalMetrics> {
    TrainingLoop::new(devices, sink).run(run, network, trainer, train, val, test)
}
