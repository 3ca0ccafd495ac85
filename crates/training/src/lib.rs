pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::CheckpointState;
pub use config::{TrainingConfig, TrainingError};
pub use data::{Batch, BatchSource, DatasetLoader, LoaderOptions};
pub use logging::{Logger, LoggingSettings};
pub use loss::{CrossEntropyLoss, LossFunction};
pub use metrics::{EpochSummary, PositiveClassCounts};
pub use optimizer::{AdamConfig, AdamOptimizer, GradientAccumulator, Optimizer};
pub use trainer::{CheckpointSettings, Termination, Trainer, TrainerSettings, TrainingOutcome};
