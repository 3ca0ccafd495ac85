use candle_core::{Device, Result, Tensor, Var};

use crate::state::ParameterState;

/// Output of a classification forward pass.
///
/// `logits` is the primary element, shaped `[batch, num_classes]`. Any
/// auxiliary tensors a network produces ride along in `pooled`.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    pub logits: Tensor,
    pub pooled: Option<Tensor>,
}

impl ClassifierOutput {
    pub fn new(logits: Tensor) -> Self {
        Self {
            logits,
            pooled: None,
        }
    }

    pub fn with_pooled(mut self, pooled: Tensor) -> Self {
        self.pooled = Some(pooled);
        self
    }
}

/// Contract between the trainer and a classification network.
pub trait Network {
    /// Maps `[batch, seq_len]` token ids to class logits. `train` toggles
    /// stochastic layers such as dropout.
    fn forward(&self, input_ids: &Tensor, train: bool) -> Result<ClassifierOutput>;

    /// Every named learnable parameter of the network.
    fn parameters(&self) -> Vec<(String, Var)>;

    /// Parameters the optimizer should update. Defaults to all of them.
    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        self.parameters()
    }

    fn num_classes(&self) -> usize;

    fn device(&self) -> &Device;

    /// Detached copy of the current parameter values.
    fn state(&self) -> Result<ParameterState> {
        ParameterState::from_parameters(&self.parameters())
    }

    /// Overwrites parameter values from `state`; names must match exactly.
    fn load_state(&self, state: &ParameterState) -> Result<()> {
        state.apply_to(&self.parameters())
    }
}

impl<N: Network + ?Sized> Network for Box<N> {
    fn forward(&self, input_ids: &Tensor, train: bool) -> Result<ClassifierOutput> {
        (**self).forward(input_ids, train)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        (**self).parameters()
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        (**self).trainable_parameters()
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn state(&self) -> Result<ParameterState> {
        (**self).state()
    }

    fn load_state(&self, state: &ParameterState) -> Result<()> {
        (**self).load_state(state)
    }
}
