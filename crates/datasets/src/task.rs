use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    dataset::Dataset, error::Error, error::Result, imdb::ImdbDataset, labels::LabelMapper,
    snli::SnliDataset,
};

/// Supported fine-tuning tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Snli,
    Imdb,
}

impl Task {
    pub fn label_mapper(self) -> LabelMapper {
        match self {
            Task::Snli => LabelMapper::snli(),
            Task::Imdb => LabelMapper::imdb(),
        }
    }

    /// Opens the dataset file in the layout this task expects.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Box<dyn Dataset>> {
        Ok(match self {
            Task::Snli => Box::new(SnliDataset::open(path)?),
            Task::Imdb => Box::new(ImdbDataset::open(path)?),
        })
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Snli => f.write_str("snli"),
            Task::Imdb => f.write_str("imdb"),
        }
    }
}

impl FromStr for Task {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "snli" | "nli" => Ok(Task::Snli),
            "imdb" | "sentiment" => Ok(Task::Imdb),
            other => Err(Error::InvalidConfig(format!("unknown task '{other}'"))),
        }
    }
}
