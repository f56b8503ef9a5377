//! Labeled image folders as lazily produced, endlessly repeating batch sequences.

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    augment::{AugmentationConfig, Augmenter},
    config::DatasetConfig,
    data::{self, WasteItem},
    error::{ConfigurationError, DataPipelineError},
    labels::{ClassMap, LabelSpace},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Training,
    Validation,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Training => write!(f, "training"),
            Split::Validation => write!(f, "validation"),
        }
    }
}

/// Anything that can hand out batch `index` of a split for a given epoch.
///
/// Implementations must be pure in `(split, epoch, index)`: asking twice yields the
/// same items, which keeps runs reproducible however batches are pulled.
pub trait BatchSource: Send + Sync {
    fn name(&self) -> &str;

    fn labels(&self) -> &LabelSpace;

    fn img_dim(&self) -> usize;

    /// Batches per epoch for `split`.
    fn cardinality(&self, split: Split) -> usize;

    fn batch(
        &self,
        split: Split,
        epoch: usize,
        index: usize,
    ) -> Result<Vec<WasteItem>, DataPipelineError>;
}

/// Infinite cursor over one split of a [`BatchSource`].
pub struct BatchStream<'a> {
    source: &'a dyn BatchSource,
    split: Split,
    epoch: usize,
    index: usize,
}

impl<'a> BatchStream<'a> {
    pub fn new(source: &'a dyn BatchSource, split: Split) -> Self {
        Self {
            source,
            split,
            epoch: 0,
            index: 0,
        }
    }

    /// Source epoch the next batch belongs to.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn restart(&mut self) {
        self.epoch = 0;
        self.index = 0;
    }
}

impl Iterator for BatchStream<'_> {
    type Item = Result<Vec<WasteItem>, DataPipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let cardinality = self.source.cardinality(self.split);
        if cardinality == 0 {
            return None;
        }

        let batch = self.source.batch(self.split, self.epoch, self.index);

        self.index += 1;
        if self.index == cardinality {
            self.index = 0;
            self.epoch += 1;
        }

        Some(batch)
    }
}

/// Pipeline-wide knobs shared by every dataset of a run.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub img_dim: usize,
    pub batch_size: usize,
    pub validation_fraction: f64,
    pub shuffle: bool,
    pub seed: u64,
    pub augmentation: AugmentationConfig,
}

#[derive(Debug, Clone)]
struct Sample {
    path: PathBuf,
    label: usize,
}

/// One dataset directory: `root/<class folder>/<image>`.
#[derive(Debug)]
pub struct DatasetSource {
    name: String,
    labels: LabelSpace,
    options: SourceOptions,
    training: Vec<Sample>,
    validation: Vec<Sample>,
    augmenter: Option<Augmenter>,
    order: Mutex<Option<(usize, Arc<Vec<usize>>)>>,
}

impl DatasetSource {
    pub fn open(
        config: &DatasetConfig,
        labels: &LabelSpace,
        options: SourceOptions,
    ) -> Result<Self, ConfigurationError> {
        let name = config.name.clone();
        let root = config.root.clone();

        if options.batch_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..1.0).contains(&options.validation_fraction) {
            return Err(ConfigurationError::InvalidValue {
                field: "validation_fraction",
                reason: format!("must lie in [0, 1), got {}", options.validation_fraction),
            });
        }
        if !root.is_dir() {
            return Err(ConfigurationError::MissingRoot {
                dataset: name,
                path: root,
            });
        }

        info!("Scanning dataset '{}' at {:?}", name, root);

        let class_map = ClassMap::new(&name, labels, &config.aliases)?;
        let folders = class_folders(&root)?;

        let mut covered = vec![false; labels.len()];
        let mut training = Vec::new();
        let mut validation = Vec::new();

        for folder in folders {
            let folder_name = folder
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let label = class_map.resolve(&folder_name)?;
            covered[label] = true;

            let files = image_files(&folder)?;
            if files.is_empty() {
                warn!(
                    "dataset '{}': class folder '{}' holds no images, \
                     label '{}' gets no weight from it",
                    name,
                    folder_name,
                    labels.name(label).unwrap_or_default()
                );
                continue;
            }

            // leading fraction of each class is held out
            let held_out = (options.validation_fraction * files.len() as f64).floor() as usize;
            let (valid_files, train_files) = files.split_at(held_out);

            debug!(
                "dataset '{}': folder '{}' -> '{}': {} training, {} validation",
                name,
                folder_name,
                labels.name(label).unwrap_or_default(),
                train_files.len(),
                valid_files.len()
            );

            validation.extend(valid_files.iter().map(|path| Sample {
                path: path.clone(),
                label,
            }));
            training.extend(train_files.iter().map(|path| Sample {
                path: path.clone(),
                label,
            }));
        }

        if let Some(missing) = covered.iter().position(|covered| !covered) {
            return Err(ConfigurationError::MissingClass {
                dataset: name,
                label: labels.name(missing).unwrap_or_default().to_string(),
            });
        }
        if training.is_empty() && validation.is_empty() {
            return Err(ConfigurationError::EmptyDataset {
                dataset: name,
                path: root,
            });
        }
        if training.is_empty() {
            return Err(ConfigurationError::EmptySplit {
                dataset: name,
                split: Split::Training,
            });
        }
        if validation.is_empty() {
            warn!("dataset '{}': validation split is empty", name);
        }

        let augmenter = options
            .augmentation
            .enabled
            .then(|| Augmenter::new(options.augmentation.clone()));

        let source = Self {
            name,
            labels: labels.clone(),
            options,
            training,
            validation,
            augmenter,
            order: Mutex::new(None),
        };

        info!(
            "dataset '{}': {} training samples ({} batches), {} validation samples ({} batches)",
            source.name,
            source.len(Split::Training),
            source.cardinality(Split::Training),
            source.len(Split::Validation),
            source.cardinality(Split::Validation)
        );

        Ok(source)
    }

    pub fn len(&self, split: Split) -> usize {
        self.samples(split).len()
    }

    /// Samples per label index for `split`.
    pub fn class_counts(&self, split: Split) -> Vec<usize> {
        let mut counts = vec![0; self.labels.len()];
        for sample in self.samples(split) {
            counts[sample.label] += 1;
        }
        counts
    }

    /// Paths of `split` in production order for epoch 0, unshuffled.
    pub fn paths(&self, split: Split) -> Vec<&Path> {
        self.samples(split).iter().map(|s| s.path.as_path()).collect()
    }

    fn samples(&self, split: Split) -> &[Sample] {
        match split {
            Split::Training => &self.training,
            Split::Validation => &self.validation,
        }
    }

    /// Training permutation for `epoch`, cached for the epoch in flight.
    fn epoch_order(&self, epoch: usize) -> Arc<Vec<usize>> {
        let mut cache = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, order)) = cache.as_ref() {
            if *cached == epoch {
                return order.clone();
            }
        }

        let mut indices: Vec<usize> = (0..self.training.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.options.seed, epoch, usize::MAX));
        indices.shuffle(&mut rng);

        let order = Arc::new(indices);
        *cache = Some((epoch, order.clone()));
        order
    }

    fn load(
        &self,
        sample: &Sample,
        augment: Option<(&Augmenter, u64)>,
    ) -> Result<WasteItem, DataPipelineError> {
        let image = data::load_image(&sample.path, &self.name)?;
        let mut resized = data::resize(&image, self.options.img_dim);

        if let Some((augmenter, seed)) = augment {
            resized = augmenter.apply(&resized, &mut ChaCha8Rng::seed_from_u64(seed));
        }

        Ok(WasteItem {
            image: data::to_chw(&resized),
            label: sample.label,
        })
    }
}

impl BatchSource for DatasetSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &LabelSpace {
        &self.labels
    }

    fn img_dim(&self) -> usize {
        self.options.img_dim
    }

    fn cardinality(&self, split: Split) -> usize {
        self.len(split).div_ceil(self.options.batch_size)
    }

    fn batch(
        &self,
        split: Split,
        epoch: usize,
        index: usize,
    ) -> Result<Vec<WasteItem>, DataPipelineError> {
        let samples = self.samples(split);
        let start = index * self.options.batch_size;
        if start >= samples.len() {
            return Err(DataPipelineError::CorruptBatch {
                dataset: self.name.clone(),
                split,
                index,
                reason: format!("only {} batches per epoch", self.cardinality(split)),
            });
        }
        let end = (start + self.options.batch_size).min(samples.len());

        let order = match split {
            Split::Training if self.options.shuffle => Some(self.epoch_order(epoch)),
            _ => None,
        };
        let augmenter = match split {
            Split::Training => self.augmenter.as_ref(),
            Split::Validation => None,
        };

        (start..end)
            .into_par_iter()
            .map(|position| {
                let sample = match &order {
                    Some(order) => &samples[order[position]],
                    None => &samples[position],
                };
                let augment = augmenter.map(|a| (a, mix_seed(self.options.seed, epoch, position)));
                self.load(sample, augment)
            })
            .collect()
    }
}

/// Immediate subdirectories of `root`, sorted by name.
fn class_folders(root: &Path) -> Result<Vec<PathBuf>, ConfigurationError> {
    let io_error = |source| ConfigurationError::Io {
        path: root.to_path_buf(),
        source,
    };

    let mut folders = Vec::new();
    for entry in fs::read_dir(root).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        if entry.file_type().map_err(io_error)?.is_dir() {
            folders.push(entry.path());
        }
    }
    folders.sort();

    Ok(folders)
}

fn image_files(folder: &Path) -> Result<Vec<PathBuf>, ConfigurationError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| ConfigurationError::Io {
            path: folder.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() && data::is_image_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn mix_seed(seed: u64, epoch: usize, position: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (position as u64).wrapping_add(1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}
