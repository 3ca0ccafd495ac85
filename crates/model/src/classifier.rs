use candle_core::{DType, Device, Error, Module, Result, Tensor, Var, D};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, VarBuilder, VarMap};

use crate::{
    config::ClassifierConfig,
    network::{ClassifierOutput, Network},
};

const CLASSIFIER_PREFIX: &str = "classifier.";
const LAYER_NORM_EPS: f64 = 1e-12;

/// Small encoder with a classification head.
///
/// Token and learned position embeddings feed a feed-forward block; the
/// non-padding positions are mean pooled and projected to class logits.
pub struct SequenceClassifier {
    config: ClassifierConfig,
    varmap: VarMap,
    token_embedding: Embedding,
    position_embedding: Embedding,
    embedding_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    dropout: Dropout,
    classifier: Linear,
}

impl SequenceClassifier {
    /// Allocates freshly initialised weights according to `config`.
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let hidden = config.hidden_dim;

        let token_embedding =
            candle_nn::embedding(config.vocab_size, hidden, vb.pp("encoder.token_embedding"))?;
        let position_embedding = candle_nn::embedding(
            config.max_seq_len,
            hidden,
            vb.pp("encoder.position_embedding"),
        )?;
        let embedding_norm =
            candle_nn::layer_norm(hidden, LAYER_NORM_EPS, vb.pp("encoder.embedding_norm"))?;
        let intermediate = candle_nn::linear(hidden, hidden * 4, vb.pp("encoder.intermediate"))?;
        let output = candle_nn::linear(hidden * 4, hidden, vb.pp("encoder.output"))?;
        let output_norm =
            candle_nn::layer_norm(hidden, LAYER_NORM_EPS, vb.pp("encoder.output_norm"))?;
        let classifier = candle_nn::linear(hidden, config.num_classes, vb.pp("classifier"))?;
        let dropout = Dropout::new(config.dropout_p.unwrap_or(0.0));

        Ok(Self {
            config,
            varmap,
            token_embedding,
            position_embedding,
            embedding_norm,
            intermediate,
            output,
            output_norm,
            dropout,
            classifier,
        })
    }

    fn encode(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        if seq_len == 0 || seq_len > self.config.max_seq_len {
            return Err(Error::Msg(format!(
                "sequence length {} outside supported range 1..={}",
                seq_len, self.config.max_seq_len
            )));
        }
        let ids = input_ids.to_dtype(DType::U32)?;

        let positions = Tensor::arange(0u32, seq_len as u32, &self.config.device)?;
        let tokens = self.token_embedding.forward(&ids)?;
        let positions = self.position_embedding.forward(&positions)?;
        let embedded = tokens.broadcast_add(&positions)?;
        let embedded = self.embedding_norm.forward(&embedded)?;
        let embedded = self.dropout.forward(&embedded, train)?;

        let ff = self.intermediate.forward(&embedded)?.gelu()?;
        let ff = self.output.forward(&ff)?;
        let ff = self.dropout.forward(&ff, train)?;
        self.output_norm.forward(&(embedded + ff)?)
    }

    fn mean_pool(&self, hidden: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
        let mask = input_ids
            .ne(self.config.pad_token_id)?
            .to_dtype(hidden.dtype())?;
        let summed = hidden.broadcast_mul(&mask.unsqueeze(D::Minus1)?)?.sum(1)?;
        // All-padding rows would otherwise divide by zero.
        let counts = mask.sum_keepdim(1)?.maximum(1f32)?;
        summed.broadcast_div(&counts)
    }

    fn sorted_vars(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut vars = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect::<Vec<_>>();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }
}

impl Network for SequenceClassifier {
    fn forward(&self, input_ids: &Tensor, train: bool) -> Result<ClassifierOutput> {
        let hidden = self.encode(input_ids, train)?;
        let pooled = self.mean_pool(&hidden, input_ids)?;
        let logits = self
            .classifier
            .forward(&self.dropout.forward(&pooled, train)?)?;
        Ok(ClassifierOutput::new(logits).with_pooled(pooled))
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.sorted_vars()
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        if !self.config.freeze_encoder {
            return self.sorted_vars();
        }
        self.sorted_vars()
            .into_iter()
            .filter(|(name, _)| name.starts_with(CLASSIFIER_PREFIX))
            .collect()
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn device(&self) -> &Device {
        &self.config.device
    }
}
