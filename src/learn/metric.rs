use crate::result::Result;
use anyhow::ensure;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Running classification accuracy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    /// Clears the counts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
    /// Counts `predictions` against `labels`.
    ///
    /// **Errors**
    /// The lengths differ.
    pub fn update(&mut self, labels: &[u32], predictions: &[u32]) -> Result<()> {
        ensure!(
            labels.len() == predictions.len(),
            "Expected {} predictions, found {}!",
            labels.len(),
            predictions.len()
        );
        self.correct += labels
            .iter()
            .zip(predictions)
            .filter(|(label, prediction)| label == prediction)
            .count();
        self.total += labels.len();
        Ok(())
    }
    /// correct / total, or None before any samples were counted.
    pub fn get(&self) -> Option<f32> {
        if self.total > 0 {
            Some(self.correct as f32 / self.total as f32)
        } else {
            None
        }
    }
    /// The number of correct predictions.
    pub fn correct(&self) -> usize {
        self.correct
    }
    /// The number of predictions.
    pub fn total(&self) -> usize {
        self.total
    }
}

/// Counts of true (rows) vs predicted (columns) classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Array2<usize>,
}

impl ConfusionMatrix {
    /// Computes the matrix for `labels` and `predictions`.
    ///
    /// **Errors**
    /// - The lengths differ.
    /// - A label or prediction is not less than `num_classes`.
    pub fn from_labels_predictions(
        labels: &[u32],
        predictions: &[u32],
        num_classes: usize,
    ) -> Result<Self> {
        ensure!(
            labels.len() == predictions.len(),
            "Expected {} predictions, found {}!",
            labels.len(),
            predictions.len()
        );
        let mut counts = Array2::zeros([num_classes, num_classes]);
        for (label, prediction) in labels.iter().zip(predictions) {
            let (label, prediction) = (*label as usize, *prediction as usize);
            ensure!(
                label < num_classes && prediction < num_classes,
                "Class out of range for {num_classes} classes (label {label}, prediction {prediction})!"
            );
            counts[[label, prediction]] += 1;
        }
        Ok(Self { counts })
    }
    /// The counts, shape = [num_classes, num_classes].
    pub fn counts(&self) -> &Array2<usize> {
        &self.counts
    }
    /// The number of classes.
    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }
}

/// Formats like a numpy array, ie `[[2 0]\n [1 1]]`.
impl Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let width = self
            .counts
            .iter()
            .map(|x| x.to_string().len())
            .max()
            .unwrap_or(1);
        write!(f, "[")?;
        for (i, row) in self.counts.outer_iter().enumerate() {
            if i > 0 {
                write!(f, "\n ")?;
            }
            write!(f, "[")?;
            for (j, count) in row.iter().enumerate() {
                if j > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{count:>width$}")?;
            }
            write!(f, "]")?;
        }
        write!(f, "]")
    }
}
