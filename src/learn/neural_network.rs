/*!
# Networks
A [`Network`] maps a batch of clips to logits and accumulates gradients on [`backward()`](Network::backward).
Networks are obtained by name from a [`ModelZoo`].

```
use deception_cv::learn::neural_network::{BuiltinZoo, ModelZoo};

# fn main() -> anyhow::Result<()> {
let zoo = BuiltinZoo::new(3);
let _network = zoo.get_model("pooled_dense", 2)?;
assert!(zoo.get_model("resnet9000", 2).is_err());
# Ok(())
# }
```
*/
use crate::result::Result;
use anyhow::{anyhow, bail, ensure};
use ndarray::{Array, Array2, ArrayD, ArrayView2, ArrayView5, Axis, Ix1, Ix2};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Optimizers.
pub mod optimizer;
use optimizer::{Optimizer, State};

/// A trainable tensor and its gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    value: ArrayD<f32>,
    grad: ArrayD<f32>,
    optimizer_state: Option<State>,
}

impl Parameter {
    /// Creates a parameter with a zeroed gradient.
    pub fn new(value: ArrayD<f32>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self {
            value,
            grad,
            optimizer_state: None,
        }
    }
    /// The value.
    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }
    /// The accumulated gradient.
    pub fn grad(&self) -> &ArrayD<f32> {
        &self.grad
    }
    /// The accumulated gradient, mutably.
    pub fn grad_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.grad
    }
    /// Fills the gradient with 0.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }
    /// The optimizer state.
    pub fn optimizer_state(&self) -> Option<&State> {
        self.optimizer_state.as_ref()
    }
    pub(crate) fn init_optimizer_state(&mut self, state: State) {
        self.optimizer_state = Some(state);
    }
    pub(crate) fn value_grad_state_mut(
        &mut self,
    ) -> (&mut ArrayD<f32>, &ArrayD<f32>, Option<&mut State>) {
        (
            &mut self.value,
            &self.grad,
            self.optimizer_state.as_mut(),
        )
    }
}

/// A classifier of clips.
pub trait Network: Send + Sync {
    /// Computes logits.
    ///
    /// - `input`: [samples, frames, channels, height, width]
    /// - output: [samples, classes]
    fn forward(&self, input: ArrayView5<f32>) -> Result<Array2<f32>>;
    /// Accumulates the gradients of the parameters, given the `input` to [`.forward()`](Network::forward)
    /// and the gradient of the loss with respect to its output.
    fn backward(&mut self, input: ArrayView5<f32>, output_grad: ArrayView2<f32>) -> Result<()>;
    /// The parameters.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;
    /// Zeroes the gradients of the parameters.
    fn zero_grad(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_grad();
        }
    }
}

/// Provides networks by name.
pub trait ModelZoo {
    /// Creates network `name` with `num_classes` outputs.
    ///
    /// **Errors**
    /// The zoo does not have `name`.
    fn get_model(&self, name: &str, num_classes: usize) -> Result<Box<dyn Network>>;
}

/// Networks implemented in this crate.
///
/// - "pooled_dense": [`PooledDense`]
#[derive(Debug, Clone)]
pub struct BuiltinZoo {
    channels: usize,
    seed: Option<u64>,
}

impl BuiltinZoo {
    /// Creates a zoo of networks taking `channels` inputs.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            seed: None,
        }
    }
    /// Seeds the initialization of the networks.
    pub fn seed(self, seed: Option<u64>) -> Self {
        Self { seed, ..self }
    }
}

impl ModelZoo for BuiltinZoo {
    fn get_model(&self, name: &str, num_classes: usize) -> Result<Box<dyn Network>> {
        match name {
            "pooled_dense" => Ok(Box::new(
                PooledDense::builder()
                    .inputs(self.channels)
                    .outputs(num_classes)
                    .seed(self.seed)
                    .build()?,
            )),
            _ => bail!("Model {name:?} not found in the zoo!"),
        }
    }
}

/// Builder for creating a [`PooledDense`].
#[derive(Debug, Default)]
pub struct PooledDenseBuilder {
    inputs: usize,
    outputs: usize,
    seed: Option<u64>,
}

impl PooledDenseBuilder {
    /// The number of input channels.
    pub fn inputs(self, inputs: usize) -> Self {
        Self { inputs, ..self }
    }
    /// The number of classes.
    pub fn outputs(self, outputs: usize) -> Self {
        Self { outputs, ..self }
    }
    /// Seeds the weight initialization.
    pub fn seed(self, seed: Option<u64>) -> Self {
        Self { seed, ..self }
    }
    /// Builds the network.
    ///
    /// The weight is initialized uniformly in ±1 / sqrt(inputs), the bias with 0.
    ///
    /// **Errors**
    /// Inputs or outputs is 0.
    pub fn build(self) -> Result<PooledDense> {
        let Self {
            inputs,
            outputs,
            seed,
        } = self;
        ensure!(inputs > 0, "PooledDense inputs must be positive!");
        ensure!(outputs > 0, "PooledDense outputs must be positive!");
        let a = 1. / (inputs as f32).sqrt();
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let distribution = Uniform::new_inclusive(-a, a);
        let weight = Array::from_shape_simple_fn([outputs, inputs], || rng.sample(distribution));
        Ok(PooledDense {
            weight: Parameter::new(weight.into_dyn()),
            bias: Parameter::new(ArrayD::zeros(vec![outputs])),
        })
    }
}

/// Global average pooling over frames and pixels followed by a dense layer.
///
/// Features are the per channel means of each sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledDense {
    weight: Parameter,
    bias: Parameter,
}

impl PooledDense {
    /// A builder.
    pub fn builder() -> PooledDenseBuilder {
        PooledDenseBuilder::default()
    }
    fn features(&self, input: ArrayView5<f32>) -> Result<Array2<f32>> {
        let channels = input.dim().2;
        let inputs = self.weight.value().shape()[1];
        ensure!(
            channels == inputs,
            "Expected {inputs} channels, found {channels}!"
        );
        input
            .mean_axis(Axis(4))
            .and_then(|x| x.mean_axis(Axis(3)))
            .and_then(|x| x.mean_axis(Axis(1)))
            .ok_or_else(|| anyhow!("Expected nonempty frames, found input {:?}!", input.shape()))
    }
}

impl Network for PooledDense {
    fn forward(&self, input: ArrayView5<f32>) -> Result<Array2<f32>> {
        let features = self.features(input)?;
        let weight = self.weight.value().view().into_dimensionality::<Ix2>()?;
        let bias = self.bias.value().view().into_dimensionality::<Ix1>()?;
        Ok(features.dot(&weight.t()) + &bias)
    }
    fn backward(&mut self, input: ArrayView5<f32>, output_grad: ArrayView2<f32>) -> Result<()> {
        let features = self.features(input)?;
        ensure!(
            output_grad.nrows() == features.nrows(),
            "Expected output grad with {} rows, found {}!",
            features.nrows(),
            output_grad.nrows()
        );
        let mut dw = self.weight.grad_mut().view_mut().into_dimensionality::<Ix2>()?;
        dw += &output_grad.t().dot(&features);
        let mut db = self.bias.grad_mut().view_mut().into_dimensionality::<Ix1>()?;
        db += &output_grad.sum_axis(Axis(0));
        Ok(())
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Applies an [`Optimizer`] to a [`Network`] with a mutable learning rate.
pub struct Trainer {
    optimizer: Box<dyn Optimizer>,
    learning_rate: f32,
}

impl Trainer {
    /// Creates a trainer.
    ///
    /// **Errors**
    /// `learning_rate` is not finite and positive.
    pub fn new(optimizer: Box<dyn Optimizer>, learning_rate: f32) -> Result<Self> {
        ensure!(
            learning_rate.is_finite() && learning_rate > 0.,
            "Learning rate {learning_rate} must be positive!"
        );
        Ok(Self {
            optimizer,
            learning_rate,
        })
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// Sets the learning rate.
    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
    /// Updates the parameters of `network`.
    ///
    /// Gradients are divided by `batch_size`, applied, and then zeroed.
    pub fn step(&self, network: &mut dyn Network, batch_size: usize) -> Result<()> {
        ensure!(batch_size > 0, "Batch size must be positive!");
        let scale = 1. / batch_size as f32;
        for parameter in network.parameters_mut() {
            parameter.grad_mut().mapv_inplace(|x| x * scale);
            self.optimizer.update(self.learning_rate, parameter)?;
            parameter.zero_grad();
        }
        Ok(())
    }
}
