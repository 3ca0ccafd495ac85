use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("unknown label '{label}' (expected one of {expected:?})")]
    UnknownLabel { label: String, expected: Vec<String> },

    #[error("label index {index} out of range for {num_classes} classes")]
    LabelIndexOutOfRange { index: usize, num_classes: usize },

    #[error("index {index} out of bounds for dataset of {len} records")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("vocabulary has no id for special token {0}")]
    MissingSpecialToken(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed record: {0}")]
    Malformed(String),
}
