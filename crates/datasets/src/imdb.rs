use std::path::Path;

use crate::{
    dataset::{Dataset, RawInput},
    error::{Error, Result},
    labels::LabelMapper,
};

const LABEL_COLUMN: usize = 0;
const TEXT_COLUMN: usize = 1;

/// IMDB reviews from a tab-separated file with a header row.
pub struct ImdbDataset {
    items: Vec<(String, String)>,
    labels: LabelMapper,
}

impl ImdbDataset {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quote(b'"')
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;

        let mut items = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let (Some(label), Some(text)) = (record.get(LABEL_COLUMN), record.get(TEXT_COLUMN))
            else {
                return Err(Error::Malformed(format!(
                    "{}: row {} has {} columns, expected at least 2",
                    path.display(),
                    line + 1,
                    record.len()
                )));
            };
            items.push((text.to_string(), label.to_string()));
        }

        tracing::info!(path = %path.display(), records = items.len(), "loaded imdb dataset");
        Ok(Self {
            items,
            labels: LabelMapper::imdb(),
        })
    }
}

impl Dataset for ImdbDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize) -> Result<(RawInput, u32)> {
        let (text, raw_label) = self.items.get(index).ok_or(Error::IndexOutOfBounds {
            index,
            len: self.items.len(),
        })?;
        let label = self.labels.map(raw_label)?;
        Ok((RawInput::Single(text.clone()), label))
    }

    fn label_mapper(&self) -> &LabelMapper {
        &self.labels
    }
}
