use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Differentiable objective mapping `(logits, labels)` to a scalar loss.
pub trait LossFunction {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor, TrainingError>;
}

impl<F> LossFunction for F
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor, TrainingError>,
{
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor, TrainingError> {
        self(logits, labels)
    }
}

/// Mean cross entropy over `[batch, num_classes]` logits, with optional label smoothing.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }
}

impl LossFunction for CrossEntropyLoss {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, num_classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects [batch, num_classes] logits, got {:?}",
                logits.dims()
            ))
        })?;
        if batch == 0 || num_classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy received an empty logits tensor",
            ));
        }
        if labels.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "labels shaped {:?} do not match a batch of {}",
                labels.dims(),
                batch
            )));
        }

        let labels = labels.to_device(logits.device()).map_err(to_runtime_error)?;
        let labels = match labels.dtype() {
            DType::U32 => labels,
            DType::I64 | DType::U8 => labels.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported label dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&labels.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let per_example = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs
                .mean(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let smoothed = nll
                .affine(1.0 - smoothing, 0.0)
                .map_err(to_runtime_error)?;
            let uniform_term = uniform.affine(smoothing, 0.0).map_err(to_runtime_error)?;
            (smoothed + uniform_term).map_err(to_runtime_error)?
        } else {
            nll
        };

        per_example.mean_all().map_err(to_runtime_error)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
