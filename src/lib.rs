pub mod artifact;
pub mod augment;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod labels;
pub mod logging;
pub mod model;
pub mod module;
pub mod source;
pub mod training;
pub mod unify;

pub use config::{DatasetConfig, RunConfig};
pub use error::{ArtifactError, ConfigurationError, DataPipelineError, Error, Result};
pub use inference::{Evaluator, Predictor};
pub use labels::LabelSpace;
pub use model::Architecture;
pub use training::{train, TrainingReport};
