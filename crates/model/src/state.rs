use std::{collections::HashMap, path::Path};

use candle_core::{Device, Error, Result, Tensor, Var};

/// Named snapshot of network parameters, detached from the autograd graph.
#[derive(Debug, Clone, Default)]
pub struct ParameterState {
    tensors: HashMap<String, Tensor>,
}

impl ParameterState {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn from_parameters(parameters: &[(String, Var)]) -> Result<Self> {
        if parameters.is_empty() {
            return Err(Error::Msg("network exposes no parameters".into()));
        }
        let mut tensors = HashMap::with_capacity(parameters.len());
        for (name, var) in parameters {
            // `copy` breaks storage sharing so later optimizer steps leave the snapshot intact.
            tensors.insert(name.clone(), var.as_tensor().detach().copy()?);
        }
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Writes every tensor into `parameters`, casting dtype and device as needed.
    ///
    /// Fails when a parameter has no entry, when shapes differ, or when the
    /// state carries names the network does not know.
    pub fn apply_to(&self, parameters: &[(String, Var)]) -> Result<()> {
        let mut remaining: HashMap<&str, &Tensor> = self
            .tensors
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();

        for (name, var) in parameters {
            let tensor = remaining
                .remove(name.as_str())
                .ok_or_else(|| Error::Msg(format!("parameter state missing '{name}'")))?;
            let target = var.as_tensor();
            if tensor.dims() != target.dims() {
                return Err(Error::Msg(format!(
                    "parameter '{name}' has shape {:?}, state holds {:?}",
                    target.dims(),
                    tensor.dims()
                )));
            }
            let tensor = tensor.to_device(target.device())?;
            let tensor = if tensor.dtype() == target.dtype() {
                tensor
            } else {
                tensor.to_dtype(target.dtype())?
            };
            var.set(&tensor)?;
        }

        if !remaining.is_empty() {
            let mut extra = remaining.keys().copied().collect::<Vec<_>>();
            extra.sort_unstable();
            return Err(Error::Msg(format!(
                "parameter state contains unknown parameters: {}",
                extra.join(", ")
            )));
        }

        Ok(())
    }

    /// Serializes the state to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.tensors.is_empty() {
            return Err(Error::Msg("refusing to save an empty parameter state".into()));
        }
        candle_core::safetensors::save(&self.tensors, path.as_ref())
    }

    /// Reads a safetensors file produced by [`ParameterState::save`].
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        Ok(Self { tensors })
    }
}
