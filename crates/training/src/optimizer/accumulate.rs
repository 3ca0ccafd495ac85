use candle_core::{backprop::GradStore, Tensor};

use super::{to_runtime_error, Optimizer};
use crate::TrainingError;

/// Sums per-batch gradients until the optimizer is asked to step.
pub struct GradientAccumulator {
    parameters: Vec<Tensor>,
    grads: Option<GradStore>,
    pending: usize,
}

impl GradientAccumulator {
    pub fn new(parameters: Vec<Tensor>) -> Self {
        Self {
            parameters,
            grads: None,
            pending: 0,
        }
    }

    /// Number of batches merged since the last flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn accumulate(&mut self, mut batch_grads: GradStore) -> Result<(), TrainingError> {
        self.pending += 1;
        let Some(accum) = self.grads.as_mut() else {
            self.grads = Some(batch_grads);
            return Ok(());
        };

        for tensor in &self.parameters {
            if let Some(grad) = batch_grads.remove(tensor) {
                let combined = if let Some(existing) = accum.remove(tensor) {
                    existing.add(&grad).map_err(to_runtime_error)?
                } else {
                    grad
                };
                accum.insert(tensor, combined);
            }
        }
        // Remaining entries belong to intermediate tensors and are dropped.
        Ok(())
    }

    /// Steps `optimizer` with the merged gradients and clears them.
    ///
    /// Returns `false` without touching the optimizer when nothing is pending.
    pub fn flush<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> Result<bool, TrainingError> {
        if self.pending == 0 {
            return Ok(false);
        }
        self.pending = 0;
        let Some(mut grads) = self.grads.take() else {
            return Ok(false);
        };
        optimizer.step(&mut grads)?;
        optimizer.zero_grad(&mut grads);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    struct Recording {
        seen: Vec<f32>,
        param: Var,
    }

    impl Optimizer for Recording {
        fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
            let grad = grads.get(self.param.as_tensor()).expect("gradient present");
            self.seen.push(grad.to_vec1::<f32>().unwrap()[0]);
            Ok(())
        }

        fn zero_grad(&mut self, grads: &mut GradStore) {
            grads.remove(self.param.as_tensor());
        }

        fn learning_rate(&self) -> f64 {
            0.0
        }
    }

    #[test]
    fn merges_gradients_across_batches() {
        let param = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut accumulator = GradientAccumulator::new(vec![param.as_tensor().clone()]);
        let mut optimizer = Recording {
            seen: vec![],
            param: param.clone(),
        };

        for scale in [1.0, 2.0, 3.0] {
            let grads = param
                .as_tensor()
                .affine(scale, 0.0)
                .unwrap()
                .sum_all()
                .unwrap()
                .backward()
                .unwrap();
            accumulator.accumulate(grads).unwrap();
        }
        assert_eq!(accumulator.pending(), 3);

        assert!(accumulator.flush(&mut optimizer).unwrap());
        assert_eq!(optimizer.seen, vec![6.0]);
        assert_eq!(accumulator.pending(), 0);
        assert!(!accumulator.flush(&mut optimizer).unwrap());
        assert_eq!(optimizer.seen.len(), 1);
    }
}
