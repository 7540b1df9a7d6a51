use super::Parameter;
use crate::result::Result;
use anyhow::{anyhow, bail};
use derive_more::Display;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    pub struct SgdBuilder {
        momentum: Option<f32>,
        weight_decay: f32,
    }

    impl SgdBuilder {
        pub(super) fn new() -> Self {
            Self {
                momentum: None,
                weight_decay: 0.,
            }
        }
        /// Momentum. Default is 0.
        ///
        /// If `momentum` is greater than 0, a "velocity" tensor will
        /// be added to the [`State`] of each [`Parameter`].
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum),
                ..self
            }
        }
        /// L2 penalty added to the gradient. Default is 0.
        pub fn weight_decay(self, weight_decay: f32) -> Self {
            Self {
                weight_decay,
                ..self
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Sgd {
            let Self {
                momentum,
                weight_decay,
            } = self;
            Sgd {
                momentum: momentum.filter(|x| *x > 0.),
                weight_decay,
            }
        }
    }
}
use builder::SgdBuilder;

/// [`State`] value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// A tensor, with the shape of the parameter.
    Tensor(ArrayD<f32>),
    /// An elem.
    Elem(f32),
}

/// Optimizer State.
///
/// Stores per parameter training progress, ie momentum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    name: String,
    key_values: Vec<(String, Value)>,
}

impl State {
    fn new(name: &str, key_values: Vec<(String, Value)>) -> Self {
        Self {
            name: name.to_string(),
            key_values,
        }
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    fn tensor_mut(&mut self, key: &str) -> Result<&mut ArrayD<f32>> {
        match self.key_values.iter_mut().find(|(k, _)| k == key) {
            Some((_, Value::Tensor(tensor))) => Ok(tensor),
            _ => bail!("{} state has no tensor {key:?}!", self.name),
        }
    }
    fn tensor_pair_mut(
        &mut self,
        a: &str,
        b: &str,
    ) -> Result<(&mut ArrayD<f32>, &mut ArrayD<f32>)> {
        let mut first = None;
        let mut second = None;
        for (key, value) in self.key_values.iter_mut() {
            if let Value::Tensor(tensor) = value {
                if key.as_str() == a {
                    first = Some(tensor);
                } else if key.as_str() == b {
                    second = Some(tensor);
                }
            }
        }
        match (first, second) {
            (Some(first), Some(second)) => Ok((first, second)),
            _ => bail!("{} state has no tensors {a:?} and {b:?}!", self.name),
        }
    }
    fn elem_mut(&mut self, key: &str) -> Result<&mut f32> {
        match self.key_values.iter_mut().find(|(k, _)| k == key) {
            Some((_, Value::Elem(elem))) => Ok(elem),
            _ => bail!("{} state has no elem {key:?}!", self.name),
        }
    }
}

/// Optimizer.
pub trait Optimizer: Send + Sync {
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// The gradient of `parameter` is expected to already be rescaled by the batch size.
    fn update(&self, learning_rate: f32, parameter: &mut Parameter) -> Result<()>;
}

/// Initializes the state of `parameter` for optimizer `name` unless it is already initialized.
fn init_state(
    parameter: &mut Parameter,
    name: &str,
    key_values: impl FnOnce(&Parameter) -> Vec<(String, Value)>,
) {
    if parameter
        .optimizer_state()
        .map_or(false, |state| state.name() == name)
    {
        return;
    }
    let key_values = key_values(parameter);
    parameter.init_optimizer_state(State::new(name, key_values));
}

fn initialized(state: Option<&mut State>) -> Result<&mut State> {
    state.ok_or_else(|| anyhow!("Optimizer state is not initialized!"))
}

fn zeros_like(parameter: &Parameter) -> Value {
    Value::Tensor(ArrayD::zeros(parameter.value().raw_dim()))
}

/// Stochastic Gradient Descent.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    momentum: Option<f32>,
    weight_decay: f32,
}

impl Sgd {
    /// An SGD builder.
    pub fn builder() -> SgdBuilder {
        SgdBuilder::new()
    }
}

impl Optimizer for Sgd {
    fn update(&self, learning_rate: f32, parameter: &mut Parameter) -> Result<()> {
        let weight_decay = self.weight_decay;
        if let Some(momentum) = self.momentum {
            init_state(parameter, "Sgd", |parameter| {
                vec![("velocity".to_string(), zeros_like(parameter))]
            });
            let (value, grad, state) = parameter.value_grad_state_mut();
            let velocity = initialized(state)?.tensor_mut("velocity")?;
            Zip::from(value)
                .and(grad)
                .and(velocity)
                .for_each(|w, dw, v| {
                    let dw = *dw + weight_decay * *w;
                    kernels::sgd_update_with_momentum(w, dw, learning_rate, momentum, v);
                });
        } else {
            let (value, grad, _) = parameter.value_grad_state_mut();
            Zip::from(value).and(grad).for_each(|w, dw| {
                *w -= learning_rate * (*dw + weight_decay * *w);
            });
        }
        Ok(())
    }
}

/// Adam, with the default betas (0.9, 0.999) and epsilon (1e-8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
}

impl Adam {
    /// Creates Adam with `weight_decay`.
    pub fn new(weight_decay: f32) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
        }
    }
}

impl Optimizer for Adam {
    fn update(&self, learning_rate: f32, parameter: &mut Parameter) -> Result<()> {
        let Self {
            beta1,
            beta2,
            epsilon,
            weight_decay,
        } = *self;
        init_state(parameter, "Adam", |parameter| {
            vec![
                ("t".to_string(), Value::Elem(0.)),
                ("mean".to_string(), zeros_like(parameter)),
                ("variance".to_string(), zeros_like(parameter)),
            ]
        });
        let (value, grad, state) = parameter.value_grad_state_mut();
        let state = initialized(state)?;
        let t = {
            let t = state.elem_mut("t")?;
            *t += 1.;
            *t
        };
        let learning_rate =
            learning_rate * (1. - beta2.powf(t)).sqrt() / (1. - beta1.powf(t));
        let (mean, variance) = state.tensor_pair_mut("mean", "variance")?;
        Zip::from(value)
            .and(grad)
            .and(mean)
            .and(variance)
            .for_each(|w, dw, m, v| {
                let dw = *dw + weight_decay * *w;
                *m = beta1 * *m + (1. - beta1) * dw;
                *v = beta2 * *v + (1. - beta2) * dw * dw;
                *w -= learning_rate * *m / (v.sqrt() + epsilon);
            });
        Ok(())
    }
}

/// RMSProp (not centered), with the default gamma1 (0.9) and epsilon (1e-8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmsProp {
    gamma1: f32,
    epsilon: f32,
    weight_decay: f32,
}

impl RmsProp {
    /// Creates RMSProp with `weight_decay`.
    pub fn new(weight_decay: f32) -> Self {
        Self {
            gamma1: 0.9,
            epsilon: 1e-8,
            weight_decay,
        }
    }
}

impl Optimizer for RmsProp {
    fn update(&self, learning_rate: f32, parameter: &mut Parameter) -> Result<()> {
        let Self {
            gamma1,
            epsilon,
            weight_decay,
        } = *self;
        init_state(parameter, "RmsProp", |parameter| {
            vec![("n".to_string(), zeros_like(parameter))]
        });
        let (value, grad, state) = parameter.value_grad_state_mut();
        let n = initialized(state)?.tensor_mut("n")?;
        Zip::from(value).and(grad).and(n).for_each(|w, dw, n| {
            let dw = *dw + weight_decay * *w;
            *n = (1. - gamma1) * dw * dw + gamma1 * *n;
            *w -= learning_rate * dw / (*n + epsilon).sqrt();
        });
        Ok(())
    }
}

/// The kind of optimizer.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// [`Sgd`] with momentum.
    #[display(fmt = "sgd")]
    Sgd,
    /// [`Adam`].
    #[display(fmt = "adam")]
    Adam,
    /// [`RmsProp`].
    #[display(fmt = "rmsprop")]
    RmsProp,
}

impl OptimizerKind {
    /// Builds the optimizer. `momentum` only applies to [`Sgd`].
    pub fn build(self, weight_decay: f32, momentum: f32) -> Box<dyn Optimizer> {
        match self {
            Self::Sgd => Box::new(
                Sgd::builder()
                    .momentum(momentum)
                    .weight_decay(weight_decay)
                    .build(),
            ),
            Self::Adam => Box::new(Adam::new(weight_decay)),
            Self::RmsProp => Box::new(RmsProp::new(weight_decay)),
        }
    }
}

mod kernels {
    // velocity holds lr scaled gradients
    pub fn sgd_update_with_momentum(w: &mut f32, dw: f32, lr: f32, m: f32, v: &mut f32) {
        *v = m * *v - lr * dw;
        *w += *v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, IxDyn};

    fn parameter(value: f32, grad: f32) -> Parameter {
        let mut parameter = Parameter::new(arr1(&[value]).into_dyn());
        parameter.grad_mut()[IxDyn(&[0])] = grad;
        parameter
    }

    #[test]
    fn sgd_without_momentum() -> Result<()> {
        let sgd = Sgd::builder().build();
        let mut p = parameter(1., 0.5);
        sgd.update(0.1, &mut p)?;
        assert_relative_eq!(p.value()[IxDyn(&[0])], 0.95, epsilon = 1e-6);
        assert!(p.optimizer_state().is_none());
        Ok(())
    }

    #[test]
    fn sgd_momentum_accumulates_velocity() -> Result<()> {
        let sgd = Sgd::builder().momentum(0.9).build();
        let mut p = parameter(1., 1.);
        sgd.update(0.1, &mut p)?;
        assert_relative_eq!(p.value()[IxDyn(&[0])], 0.9, epsilon = 1e-6);
        sgd.update(0.1, &mut p)?;
        // v = 0.9 * -0.1 - 0.1 = -0.19
        assert_relative_eq!(p.value()[IxDyn(&[0])], 0.71, epsilon = 1e-6);
        assert_eq!(p.optimizer_state().unwrap().name(), "Sgd");
        Ok(())
    }

    #[test]
    fn sgd_decay_keeps_velocity() -> Result<()> {
        let sgd = Sgd::builder().momentum(0.9).build();
        let mut p = parameter(1., 1.);
        sgd.update(1., &mut p)?;
        assert_relative_eq!(p.value()[IxDyn(&[0])], 0., epsilon = 1e-6);
        p.zero_grad();
        sgd.update(0.1, &mut p)?;
        // the velocity of -1 decays by momentum only
        assert_relative_eq!(p.value()[IxDyn(&[0])], -0.9, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn sgd_weight_decay() -> Result<()> {
        let sgd = Sgd::builder().weight_decay(0.5).build();
        let mut p = parameter(2., 0.);
        sgd.update(0.1, &mut p)?;
        assert_relative_eq!(p.value()[IxDyn(&[0])], 1.9, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() -> Result<()> {
        let adam = Adam::new(0.);
        let mut p = parameter(1., 3.);
        adam.update(0.01, &mut p)?;
        assert_relative_eq!(p.value()[IxDyn(&[0])], 0.99, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn rmsprop_descends() -> Result<()> {
        let rmsprop = RmsProp::new(0.);
        let mut p = parameter(1., 2.);
        rmsprop.update(0.01, &mut p)?;
        assert!(p.value()[IxDyn(&[0])] < 1.);
        Ok(())
    }

    #[test]
    fn optimizer_kind_names() {
        assert_eq!(OptimizerKind::Sgd.to_string(), "sgd");
        let kind: OptimizerKind = serde_json::from_str("\"rmsprop\"").unwrap();
        assert_eq!(kind, OptimizerKind::RmsProp);
    }
}
