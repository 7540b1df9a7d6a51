use crate::result::Result;
use anyhow::ensure;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Evaluates `input` against `target`.
pub trait Criterion<X, T> {
    /// The output.
    type Output;
    /// Evaluates the criterion.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Predicted classes, the index of the max of each row of logits.
///
/// Ties resolve to the lowest index.
pub fn argmax(input: ArrayView2<f32>) -> Array1<u32> {
    input
        .outer_iter()
        .map(|x| {
            let mut max = x[0];
            let mut max_index = 0;
            for (i, x) in x.iter().copied().enumerate() {
                if x > max {
                    max = x;
                    max_index = i;
                }
            }
            max_index as u32
        })
        .collect()
}

/// Softmax cross entropy loss.
///
/// Evaluating returns the per sample loss and the gradient of the summed loss with respect to the
/// logits.
#[derive(Default, Debug, Clone, Copy)]
pub struct CrossEntropyLoss;

impl<'a, 'b> Criterion<ArrayView2<'a, f32>, ArrayView1<'b, u32>> for CrossEntropyLoss {
    type Output = (Array1<f32>, Array2<f32>);
    fn eval(
        &self,
        input: ArrayView2<'a, f32>,
        target: ArrayView1<'b, u32>,
    ) -> Result<Self::Output> {
        let (batch_size, classes) = input.dim();
        ensure!(
            batch_size == target.len(),
            "Expected {batch_size} targets, found {}!",
            target.len()
        );
        ensure!(classes > 0, "Expected at least 1 class!");
        let mut loss = Array1::zeros(batch_size);
        let mut grad = Array2::zeros([batch_size, classes]);
        for (((x, t), loss), mut dx) in input
            .outer_iter()
            .zip(target.iter().copied())
            .zip(loss.iter_mut())
            .zip(grad.outer_iter_mut())
        {
            let t = t as usize;
            ensure!(t < classes, "Target {t} out of range for {classes} classes!");
            let m = x.iter().copied().fold(x[0], f32::max);
            let s: f32 = x.iter().map(|x| (x - m).exp()).sum();
            *loss = s.ln() - (x[t] - m);
            for (i, (dx, x)) in dx.iter_mut().zip(x.iter()).enumerate() {
                let p = (x - m).exp() / s;
                *dx = if i == t { p - 1. } else { p };
            }
        }
        Ok((loss, grad))
    }
}
