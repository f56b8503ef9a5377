use std::path::Path;

use burn::{data::dataloader::batcher::Batcher, prelude::*, tensor::ElementConversion};
use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    artifact::{self, ArtifactMetadata, ModelArtifact},
    data::{self, WasteBatcher, WasteItem},
    error::{ConfigurationError, DataPipelineError, Error, Result},
    labels::LabelSpace,
    model::{categorical_cross_entropy, Network},
    source::{BatchSource, BatchStream, Split},
};

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub label_index: usize,
    pub label: String,
    pub confidence: f32,
    /// One entry per label, in label-space order.
    pub probabilities: Vec<f32>,
}

/// Classifies single images with a trained artifact.
pub struct Predictor<B: Backend> {
    network: Network<B>,
    metadata: ArtifactMetadata,
    labels: LabelSpace,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn load(path: &Path, labels: &LabelSpace, device: B::Device) -> Result<Self> {
        let ModelArtifact { metadata, network } = artifact::load::<B>(path, labels, &device)?;

        Ok(Self {
            network,
            metadata,
            labels: labels.clone(),
            device,
        })
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    pub fn predict_path(&self, path: &Path) -> Result<Prediction, DataPipelineError> {
        let image = data::load_image(path, "input")?;
        let prediction = self.predict_image(&image);
        debug!("{:?} -> {} ({:.3})", path, prediction.label, prediction.confidence);
        Ok(prediction)
    }

    /// Resizes and rescales like training, then runs one forward pass.
    pub fn predict_image(&self, image: &DynamicImage) -> Prediction {
        let item = WasteItem {
            image: data::preprocess(image, self.metadata.img_dim),
            label: 0,
        };
        let batcher =
            WasteBatcher::<B>::new(self.device.clone(), self.metadata.img_dim, self.labels.len());
        let probabilities: Vec<f32> = self
            .network
            .forward_probabilities(batcher.images(&[item]))
            .into_data()
            .iter::<f32>()
            .collect();

        let (label_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .unwrap_or((0, 0.0));

        Prediction {
            label_index,
            label: self.labels.name(label_index).unwrap_or_default().to_string(),
            confidence,
            probabilities,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassAccuracy {
    pub label: String,
    pub samples: usize,
    pub correct: usize,
}

impl ClassAccuracy {
    /// `None` when the class had no samples.
    pub fn accuracy(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.correct as f64 / self.samples as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub steps: usize,
    pub samples: usize,
    /// Sample-weighted mean cross-entropy.
    pub loss: f64,
    pub accuracy: f64,
    pub per_class: Vec<ClassAccuracy>,
}

/// Runs `network` over the first `steps` validation batches of `source` without gradients.
///
/// `steps` defaults to the validation cardinality.
pub fn evaluate<B: Backend>(
    network: &Network<B>,
    source: &dyn BatchSource,
    steps: Option<usize>,
    device: &B::Device,
) -> Result<EvaluationReport> {
    let steps = steps.unwrap_or_else(|| source.cardinality(Split::Validation));
    if steps == 0 || source.cardinality(Split::Validation) == 0 {
        return Err(ConfigurationError::EmptySplit {
            dataset: source.name().to_string(),
            split: Split::Validation,
        }
        .into());
    }

    let labels = source.labels();
    let batcher = WasteBatcher::<B>::new(device.clone(), source.img_dim(), labels.len());
    let mut stream = BatchStream::new(source, Split::Validation);

    let mut loss_sum = 0.0;
    let mut samples = 0;
    let mut per_class: Vec<ClassAccuracy> = labels
        .names()
        .iter()
        .map(|label| ClassAccuracy {
            label: label.clone(),
            samples: 0,
            correct: 0,
        })
        .collect();

    for _ in 0..steps {
        let items = stream
            .next()
            .ok_or(DataPipelineError::Exhausted {
                split: Split::Validation,
            })??;
        let expected: Vec<usize> = items.iter().map(|item| item.label).collect();
        let batch = batcher.batch(items);

        let logits = network.forward(batch.images);
        let loss = categorical_cross_entropy(logits.clone(), batch.targets);
        let predicted = logits.argmax(1).into_data();

        loss_sum += loss.into_scalar().elem::<f64>() * expected.len() as f64;
        samples += expected.len();

        for (label, guess) in expected.iter().zip(predicted.iter::<i64>()) {
            let class = &mut per_class[*label];
            class.samples += 1;
            if guess as usize == *label {
                class.correct += 1;
            }
        }
    }

    let correct: usize = per_class.iter().map(|class| class.correct).sum();

    Ok(EvaluationReport {
        steps,
        samples,
        loss: loss_sum / samples as f64,
        accuracy: correct as f64 / samples as f64,
        per_class,
    })
}

/// Scores a trained artifact on the validation split of a batch source.
pub struct Evaluator<B: Backend> {
    network: Network<B>,
    metadata: ArtifactMetadata,
    labels: LabelSpace,
    device: B::Device,
}

impl<B: Backend> Evaluator<B> {
    pub fn load(path: &Path, labels: &LabelSpace, device: B::Device) -> Result<Self> {
        let ModelArtifact { metadata, network } = artifact::load::<B>(path, labels, &device)?;

        Ok(Self {
            network,
            metadata,
            labels: labels.clone(),
            device,
        })
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    pub fn evaluate(
        &self,
        source: &dyn BatchSource,
        steps: Option<usize>,
    ) -> Result<EvaluationReport> {
        self.labels
            .ensure_matches(source.labels(), &format!("evaluating on '{}'", source.name()))?;
        if source.img_dim() != self.metadata.img_dim {
            return Err(Error::Configuration(ConfigurationError::ResolutionMismatch {
                context: format!("evaluating on '{}'", source.name()),
                expected: self.metadata.img_dim,
                found: source.img_dim(),
            }));
        }

        let report = evaluate(&self.network, source, steps, &self.device)?;
        info!(
            "Evaluated {} samples over {} batches: loss {:.4}, accuracy {:.4}",
            report.samples, report.steps, report.loss, report.accuracy
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{
        artifact::BEST_MODEL_FILE,
        model::{Architecture, ModelConfig},
    };

    type TestBackend = NdArray<f32>;

    fn saved_predictor(dir: &Path) -> std::path::PathBuf {
        let path = dir.join(BEST_MODEL_FILE);
        let config = ModelConfig::new(Architecture::Scratch, 6, 24);
        let network = config.init::<TestBackend>(&Default::default()).unwrap();
        let metadata = ArtifactMetadata::new(&LabelSpace::waste(), config, 1, 1.0, 0.2);
        artifact::save(&path, &metadata, &network).unwrap();
        path
    }

    #[test]
    fn prediction_is_a_distribution_over_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved_predictor(dir.path());
        let predictor =
            Predictor::<TestBackend>::load(&path, &LabelSpace::waste(), Default::default())
                .unwrap();

        // any native size is accepted
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([30, 120, 200])));
        let prediction = predictor.predict_image(&image);

        assert_eq!(prediction.probabilities.len(), 6);
        let total: f32 = prediction.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert_eq!(prediction.confidence, prediction.probabilities[prediction.label_index]);
        assert_eq!(prediction.label, LabelSpace::waste().name(prediction.label_index).unwrap());
    }

    #[test]
    fn unreadable_input_is_a_pipeline_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved_predictor(dir.path());
        let predictor =
            Predictor::<TestBackend>::load(&path, &LabelSpace::waste(), Default::default())
                .unwrap();

        let err = predictor.predict_path(&dir.path().join("missing.jpg")).unwrap_err();
        assert!(matches!(err, DataPipelineError::Unreadable { .. }));
    }

    #[test]
    fn class_accuracy_without_samples() {
        let class = ClassAccuracy {
            label: "trash".to_string(),
            samples: 0,
            correct: 0,
        };
        assert_eq!(class.accuracy(), None);
    }
}
