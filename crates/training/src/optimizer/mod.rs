pub mod accumulate;

pub use accumulate::GradientAccumulator;

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

/// Parameter update rule driven by accumulated gradients.
pub trait Optimizer {
    /// Applies one update from the gradients in `grads`.
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError>;

    /// Drops every gradient this optimizer owns from `grads`.
    fn zero_grad(&mut self, grads: &mut GradStore);

    fn learning_rate(&self) -> f64;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        (**self).step(grads)
    }

    fn zero_grad(&mut self, grads: &mut GradStore) {
        (**self).zero_grad(grads)
    }

    fn learning_rate(&self) -> f64 {
        (**self).learning_rate()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Decay weights directly (AdamW) instead of folding decay into the gradient.
    pub decoupled_weight_decay: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            decoupled_weight_decay: false,
        }
    }
}

impl From<&config::OptimizerConfig> for AdamConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
            decoupled_weight_decay: value.algorithm == config::OptimizerType::AdamW,
        }
    }
}

/// Adam with a fixed learning rate and bias-corrected moments kept in f32.
#[derive(Debug)]
pub struct AdamOptimizer {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl AdamOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if config.learning_rate <= 0.0 {
            return Err(TrainingError::initialization(
                "optimizer learning rate must be greater than 0",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            params.push(ParameterSlot {
                param: var,
                dtype,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }
}

impl Optimizer for AdamOptimizer {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((index, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;

            let grad = if cfg.weight_decay != 0.0 && !cfg.decoupled_weight_decay {
                let decay = base
                    .affine(cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad
                .affine(1.0 - cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let decayed = if cfg.weight_decay != 0.0 && cfg.decoupled_weight_decay {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            let next = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    fn zero_grad(&mut self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_grads(var: &Var) -> GradStore {
        // d/dx sum(x^2) = 2x
        var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn step_moves_parameters_against_gradient() {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let mut optimizer = AdamOptimizer::new(
            vec![("x".into(), var.clone())],
            AdamConfig {
                learning_rate: 0.1,
                ..AdamConfig::default()
            },
        )
        .unwrap();

        let mut grads = quadratic_grads(&var);
        optimizer.step(&mut grads).unwrap();

        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        // The first bias-corrected Adam step moves each weight by ~lr.
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 1.9).abs() < 1e-4);
        assert_eq!(optimizer.steps(), 1);
    }

    #[test]
    fn empty_gradient_store_is_not_a_step() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let other = Var::new(&[3.0f32], &Device::Cpu).unwrap();
        let mut optimizer =
            AdamOptimizer::new(vec![("x".into(), var.clone())], AdamConfig::default()).unwrap();

        let mut grads = quadratic_grads(&other);
        optimizer.step(&mut grads).unwrap();

        assert_eq!(optimizer.steps(), 0);
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
    }

    #[test]
    fn zero_grad_clears_owned_gradients() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut optimizer =
            AdamOptimizer::new(vec![("x".into(), var.clone())], AdamConfig::default()).unwrap();

        let mut grads = quadratic_grads(&var);
        assert!(grads.get(var.as_tensor()).is_some());
        optimizer.zero_grad(&mut grads);
        assert!(grads.get(var.as_tensor()).is_none());
    }

    #[test]
    fn decoupled_decay_shrinks_weights_without_gradient_signal() {
        let var = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut optimizer = AdamOptimizer::new(
            vec![("x".into(), var.clone())],
            AdamConfig {
                learning_rate: 0.1,
                weight_decay: 0.5,
                decoupled_weight_decay: true,
                ..AdamConfig::default()
            },
        )
        .unwrap();

        // Multiplying by a zero tensor keeps the edge to `x`, unlike a zero affine scale.
        let zeros = var.as_tensor().zeros_like().unwrap();
        let mut grads = var
            .as_tensor()
            .mul(&zeros)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();
        assert!(grads.get(var.as_tensor()).is_some());
        optimizer.step(&mut grads).unwrap();
        assert_eq!(optimizer.steps(), 1);

        let value = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value - 1.9).abs() < 1e-5);
    }

    #[test]
    fn rejects_empty_parameter_list() {
        assert!(AdamOptimizer::new(vec![], AdamConfig::default()).is_err());
    }
}
