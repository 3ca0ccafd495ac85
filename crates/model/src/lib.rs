pub mod classifier;
pub mod config;
pub mod network;
pub mod state;

pub use classifier::SequenceClassifier;
pub use config::ClassifierConfig;
pub use network::{ClassifierOutput, Network};
pub use state::ParameterState;
