use serde::{Deserialize, Serialize};

/// Step decay of the learning rate at listed epochs.
///
/// The decay epochs are walked in order, one consumed each time the current epoch matches. Once
/// every entry has been consumed the learning rate is left unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    decay_epochs: Vec<usize>,
    factor: f32,
    cursor: usize,
}

impl LrSchedule {
    /// Decays by 0.1 at each of `decay_epochs`.
    pub fn new(decay_epochs: Vec<usize>) -> Self {
        Self {
            decay_epochs,
            factor: 0.1,
            cursor: 0,
        }
    }
    /// The multiplier applied at each decay. Defaults to 0.1.
    pub fn factor(self, factor: f32) -> Self {
        Self { factor, ..self }
    }
    /// The learning rate for `epoch`, given the current `learning_rate`.
    ///
    /// Call once per epoch, in order.
    pub fn step(&mut self, epoch: usize, learning_rate: f32) -> f32 {
        match self.decay_epochs.get(self.cursor) {
            Some(decay_epoch) if *decay_epoch == epoch => {
                self.cursor += 1;
                learning_rate * self.factor
            }
            _ => learning_rate,
        }
    }
    /// Whether every decay epoch has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.decay_epochs.len()
    }
}
