use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SNLI_LABELS: [&str; 3] = ["neutral", "entailment", "contradiction"];
// Raw IMDB ratings are 1-indexed: "1" negative, "2" positive.
const IMDB_LABELS: [&str; 2] = ["1", "2"];

/// Bidirectional mapping between raw string labels and zero-indexed classes.
///
/// Serializes to a small JSON document so inference code can recover the
/// same mapping the network was trained with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LabelMapperRepr", into = "LabelMapperRepr")]
pub struct LabelMapper {
    labels: Vec<String>,
    index: HashMap<String, usize>,
    positive: usize,
}

#[derive(Serialize, Deserialize)]
struct LabelMapperRepr {
    labels: Vec<String>,
    positive_label: String,
}

impl LabelMapper {
    /// Builds a mapper over `labels` in order; `positive_label` must be one of them.
    pub fn new<I, S>(labels: I, positive_label: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "a label mapper needs at least two classes, got {}",
                labels.len()
            )));
        }
        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), i).is_some() {
                return Err(Error::InvalidConfig(format!("duplicate label '{label}'")));
            }
        }
        let positive = *index.get(positive_label).ok_or_else(|| Error::UnknownLabel {
            label: positive_label.to_string(),
            expected: labels.clone(),
        })?;
        Ok(Self {
            labels,
            index,
            positive,
        })
    }

    /// `neutral`, `entailment`, `contradiction`; the positive class is `entailment`.
    pub fn snli() -> Self {
        Self::from_static(&SNLI_LABELS, 1)
    }

    /// IMDB ratings `1` and `2`; the positive class is `2`.
    pub fn imdb() -> Self {
        Self::from_static(&IMDB_LABELS, 1)
    }

    fn from_static(labels: &[&str], positive: usize) -> Self {
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let index = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        Self {
            labels,
            index,
            positive,
        }
    }

    pub fn map(&self, raw: &str) -> Result<u32> {
        self.index
            .get(raw)
            .map(|&i| i as u32)
            .ok_or_else(|| Error::UnknownLabel {
                label: raw.to_string(),
                expected: self.labels.clone(),
            })
    }

    pub fn reverse_map(&self, index: usize) -> Result<&str> {
        self.labels
            .get(index)
            .map(String::as_str)
            .ok_or(Error::LabelIndexOutOfRange {
                index,
                num_classes: self.labels.len(),
            })
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn positive_label(&self) -> &str {
        &self.labels[self.positive]
    }

    pub fn positive_label_index(&self) -> usize {
        self.positive
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl TryFrom<LabelMapperRepr> for LabelMapper {
    type Error = Error;

    fn try_from(value: LabelMapperRepr) -> Result<Self> {
        LabelMapper::new(value.labels, &value.positive_label)
    }
}

impl From<LabelMapper> for LabelMapperRepr {
    fn from(value: LabelMapper) -> Self {
        let positive_label = value.labels[value.positive].clone();
        Self {
            labels: value.labels,
            positive_label,
        }
    }
}
