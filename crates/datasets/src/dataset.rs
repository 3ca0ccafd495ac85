use crate::{error::Result, labels::LabelMapper};

/// Unprocessed model input as read from a dataset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawInput {
    Single(String),
    Pair { premise: String, hypothesis: String },
}

/// Random-access provider of `(raw_input, label_index)` pairs.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the record at `index` with its label already mapped to a class index.
    fn get(&self, index: usize) -> Result<(RawInput, u32)>;

    fn label_mapper(&self) -> &LabelMapper;
}

impl<D: Dataset + ?Sized> Dataset for Box<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<(RawInput, u32)> {
        (**self).get(index)
    }

    fn label_mapper(&self) -> &LabelMapper {
        (**self).label_mapper()
    }
}
