//! Dataset readers, label mappers and preprocessors for the supported
//! classification tasks.

pub mod dataset;
pub mod error;
pub mod imdb;
pub mod labels;
pub mod preprocess;
pub mod snli;
pub mod task;

pub use dataset::{Dataset, RawInput};
pub use error::{Error, Result};
pub use imdb::ImdbDataset;
pub use labels::LabelMapper;
pub use preprocess::{BertPreprocessor, Preprocessor, TextTokenizer};
pub use snli::{SnliDataset, SnliRecord};
pub use task::Task;
