//! Error taxonomy for the training core.
//!
//! Three families, none of them retried: configuration problems found at startup,
//! data pipeline failures that abort the run in progress, and artifact failures
//! surfaced to whoever asked for the model.

use std::path::PathBuf;

use thiserror::Error;

use crate::source::Split;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("dataset '{dataset}': root directory {path:?} does not exist or is not a directory")]
    MissingRoot { dataset: String, path: PathBuf },

    #[error("dataset '{dataset}': no images found under {path:?}")]
    EmptyDataset { dataset: String, path: PathBuf },

    #[error("dataset '{dataset}': the {split} split has no samples")]
    EmptySplit { dataset: String, split: Split },

    #[error("dataset '{dataset}': class folder '{folder}' does not map onto the label space")]
    UnmappedClass { dataset: String, folder: String },

    #[error("dataset '{dataset}': label '{label}' has no class folder")]
    MissingClass { dataset: String, label: String },

    #[error("dataset '{dataset}': alias '{folder}' targets unknown label '{label}'")]
    UnknownLabel {
        dataset: String,
        folder: String,
        label: String,
    },

    #[error("{context}: label space mismatch, expected {expected:?}, found {found:?}")]
    LabelSpaceMismatch {
        context: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("{context}: image dimension {found} does not match required {expected}")]
    ResolutionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid label space: {0}")]
    InvalidLabelSpace(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to load backbone weights from {path:?}: {reason}")]
    BackboneWeights { path: PathBuf, reason: String },

    #[error("I/O error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DataPipelineError {
    #[error("dataset '{dataset}': unreadable image {path:?}: {source}")]
    Unreadable {
        dataset: String,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("dataset '{dataset}': batch {index} of the {split} split is corrupt: {reason}")]
    CorruptBatch {
        dataset: String,
        split: Split,
        index: usize,
        reason: String,
    },

    #[error("the {split} stream produced no batch")]
    Exhausted { split: Split },
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("model artifact {0:?} does not exist")]
    Missing(PathBuf),

    #[error("model artifact {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("model artifact {path:?} was trained on {found:?}, expected {expected:?}")]
    LabelSpaceMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("model artifact {path:?} does not fit this run: {reason}")]
    Incompatible { path: PathBuf, reason: String },

    #[error("I/O error on model artifact {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Any failure raised by the training core.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    DataPipeline(#[from] DataPipelineError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
