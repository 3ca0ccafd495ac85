use std::{fs::File, io::BufReader, path::Path};

use serde::Deserialize;

use crate::{
    dataset::{Dataset, RawInput},
    error::{Error, Result},
    labels::LabelMapper,
};

#[derive(Debug, Deserialize)]
struct RowsDocument {
    rows: Vec<RowEnvelope>,
}

#[derive(Debug, Deserialize)]
struct RowEnvelope {
    row: SnliRecord,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnliRecord {
    pub premise: String,
    pub hypothesis: String,
    pub label: String,
}

/// SNLI premise/hypothesis pairs in the HuggingFace datasets-server rows layout.
pub struct SnliDataset {
    records: Vec<SnliRecord>,
    labels: LabelMapper,
}

impl SnliDataset {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let document: RowsDocument = serde_json::from_reader(reader)?;
        let records = document.rows.into_iter().map(|r| r.row).collect::<Vec<_>>();
        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "loaded snli dataset"
        );
        Ok(Self::from_records(records))
    }

    pub fn from_records(records: Vec<SnliRecord>) -> Self {
        Self {
            records,
            labels: LabelMapper::snli(),
        }
    }
}

impl Dataset for SnliDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> Result<(RawInput, u32)> {
        let record = self.records.get(index).ok_or(Error::IndexOutOfBounds {
            index,
            len: self.records.len(),
        })?;
        let label = self.labels.map(&record.label)?;
        Ok((
            RawInput::Pair {
                premise: record.premise.clone(),
                hypothesis: record.hypothesis.clone(),
            },
            label,
        ))
    }

    fn label_mapper(&self) -> &LabelMapper {
        &self.labels
    }
}
