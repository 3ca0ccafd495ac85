use candle_core::{DType, Device, Error, Result};

/// Hyperparameters for [`crate::SequenceClassifier`].
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub max_seq_len: usize,
    pub num_classes: usize,
    pub pad_token_id: u32,
    pub dropout_p: Option<f32>,
    pub freeze_encoder: bool,
    pub dtype: DType,
    pub device: Device,
}

impl ClassifierConfig {
    /// Validate structural invariants before any weights are allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.max_seq_len == 0 {
            return Err(Error::Msg("max_seq_len must be greater than zero".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Msg(format!(
                "num_classes must be at least 2 (got {})",
                self.num_classes
            )));
        }
        if self.pad_token_id as usize >= self.vocab_size {
            return Err(Error::Msg(format!(
                "pad_token_id ({}) must be below vocab_size ({})",
                self.pad_token_id, self.vocab_size
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "classifier parameters must be floating point, got {:?}",
                self.dtype
            )));
        }
        Ok(())
    }
}
