//! Single-file model artifact.
//!
//! A gzip-compressed tar holding two entries:
//! - `metadata.json`: label space, preprocessing contract, model config, metrics
//! - `model.bin`: full-precision burn binary record of the network

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use burn::{
    prelude::*,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, Header};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{
    error::ArtifactError,
    labels::LabelSpace,
    model::{Architecture, ModelConfig, Network, NetworkRecord},
};

pub const FORMAT_VERSION: u32 = 1;

/// File name of the best-model artifact inside an artifact directory.
pub const BEST_MODEL_FILE: &str = "best_model.tar.gz";

const METADATA_ENTRY: &str = "metadata.json";
const WEIGHTS_ENTRY: &str = "model.bin";

type ArtifactRecorder = BinBytesRecorder<FullPrecisionSettings>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub format_version: u32,
    /// Label names in head output order.
    pub labels: Vec<String>,
    pub img_dim: usize,
    pub channel_order: String,
    /// Factor applied to raw 8-bit intensities.
    pub scale: f32,
    pub model: ModelConfig,
    pub epoch: usize,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

impl ArtifactMetadata {
    pub fn new(
        labels: &LabelSpace,
        model: ModelConfig,
        epoch: usize,
        val_loss: f64,
        val_accuracy: f64,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            labels: labels.names().to_vec(),
            img_dim: model.img_dim,
            channel_order: "RGB".to_string(),
            scale: 1.0 / 255.0,
            model,
            epoch,
            val_loss,
            val_accuracy,
        }
    }
}

pub struct ModelArtifact<B: Backend> {
    pub metadata: ArtifactMetadata,
    pub network: Network<B>,
}

/// Writes the artifact next to `path` and renames it into place.
///
/// A reader opening `path` sees either the previous artifact or the new one, never a
/// partial write.
pub fn save<B: Backend>(
    path: &Path,
    metadata: &ArtifactMetadata,
    network: &Network<B>,
) -> Result<(), ArtifactError> {
    let io_error = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&directory).map_err(io_error)?;

    let json = serde_json::to_vec_pretty(metadata).map_err(|e| ArtifactError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("cannot serialize metadata: {e}"),
    })?;

    let recorder = ArtifactRecorder::default();
    let record = network.clone().into_record();
    let weights = <ArtifactRecorder as Recorder<B>>::record(&recorder, record, ()).map_err(|e| {
        ArtifactError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("cannot record weights: {e:?}"),
        }
    })?;

    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append_entry(&mut builder, METADATA_ENTRY, &json).map_err(io_error)?;
    append_entry(&mut builder, WEIGHTS_ENTRY, &weights).map_err(io_error)?;
    let bytes = builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(io_error)?;

    let mut temp = NamedTempFile::new_in(&directory).map_err(io_error)?;
    temp.write_all(&bytes).map_err(io_error)?;
    temp.as_file().sync_all().map_err(io_error)?;
    temp.persist(path).map_err(|e| io_error(e.error))?;

    debug!(
        "Wrote artifact {:?} ({} bytes, epoch {}, val_loss {:.4})",
        path,
        bytes.len(),
        metadata.epoch,
        metadata.val_loss
    );

    Ok(())
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    name: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)
}

fn read_entries(path: &Path) -> Result<(ArtifactMetadata, Vec<u8>), ArtifactError> {
    if !path.is_file() {
        return Err(ArtifactError::Missing(path.to_path_buf()));
    }
    let corrupt = |reason: String| ArtifactError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut metadata = None;
    let mut weights = None;

    for entry in archive.entries().map_err(|e| corrupt(e.to_string()))? {
        let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        let mut buffer = Vec::new();
        entry
            .read_to_end(&mut buffer)
            .map_err(|e| corrupt(e.to_string()))?;

        match name.as_str() {
            METADATA_ENTRY => {
                let parsed: ArtifactMetadata = serde_json::from_slice(&buffer)
                    .map_err(|e| corrupt(format!("invalid {METADATA_ENTRY}: {e}")))?;
                metadata = Some(parsed);
            }
            WEIGHTS_ENTRY => weights = Some(buffer),
            _ => {}
        }
    }

    match (metadata, weights) {
        (Some(metadata), Some(weights)) => Ok((metadata, weights)),
        (None, _) => Err(corrupt(format!("{METADATA_ENTRY} not found"))),
        (_, None) => Err(corrupt(format!("{WEIGHTS_ENTRY} not found"))),
    }
}

/// Reads only the metadata entry.
pub fn load_metadata(path: &Path) -> Result<ArtifactMetadata, ArtifactError> {
    read_entries(path).map(|(metadata, _)| metadata)
}

/// Loads an artifact and checks it was trained on `labels`.
///
/// The stored weights must match the recorded model config in variant and in size.
pub fn load<B: Backend>(
    path: &Path,
    labels: &LabelSpace,
    device: &B::Device,
) -> Result<ModelArtifact<B>, ArtifactError> {
    let (metadata, weights) = read_entries(path)?;

    if metadata.format_version != FORMAT_VERSION {
        return Err(ArtifactError::Incompatible {
            path: path.to_path_buf(),
            reason: format!(
                "format version {} is not supported (expected {})",
                metadata.format_version, FORMAT_VERSION
            ),
        });
    }
    if metadata.labels != labels.names() {
        return Err(ArtifactError::LabelSpaceMismatch {
            path: path.to_path_buf(),
            expected: labels.names().to_vec(),
            found: metadata.labels.clone(),
        });
    }
    if metadata.model.classes != labels.len() || metadata.model.img_dim != metadata.img_dim {
        return Err(ArtifactError::Corrupt {
            path: path.to_path_buf(),
            reason: "model config disagrees with the recorded label space or resolution"
                .to_string(),
        });
    }

    let recorder = ArtifactRecorder::default();
    let record: NetworkRecord<B> = <ArtifactRecorder as Recorder<B>>::load(
        &recorder, weights, device,
    )
    .map_err(|e| ArtifactError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("cannot decode weights: {e:?}"),
    })?;

    let stored = match &record {
        NetworkRecord::Scratch(_) => Architecture::Scratch,
        NetworkRecord::Transfer(_) => Architecture::Transfer,
    };
    if stored != metadata.model.architecture {
        return Err(ArtifactError::Corrupt {
            path: path.to_path_buf(),
            reason: format!(
                "weights belong to a {stored} network, metadata describes a {} network",
                metadata.model.architecture
            ),
        });
    }

    let network = metadata
        .model
        .build::<B>(device)
        .map_err(|e| ArtifactError::Incompatible {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let expected_params = network.num_params();
    let network = network.load_record(record).freeze_backbone();
    if network.num_params() != expected_params {
        return Err(ArtifactError::Corrupt {
            path: path.to_path_buf(),
            reason: format!(
                "weight shapes do not fit a {} network at {}px",
                metadata.model.architecture, metadata.img_dim
            ),
        });
    }

    info!(
        "Loaded {} artifact {:?} (epoch {}, val_loss {:.4}, val_accuracy {:.4})",
        metadata.model.architecture, path, metadata.epoch, metadata.val_loss, metadata.val_accuracy
    );

    Ok(ModelArtifact { metadata, network })
}
