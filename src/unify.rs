//! Concatenation of several batch sources into one combined sequence.

use tracing::info;

use crate::{
    config::DatasetConfig,
    data::WasteItem,
    error::{ConfigurationError, DataPipelineError},
    labels::LabelSpace,
    source::{BatchSource, DatasetSource, SourceOptions, Split},
};

/// Sources played back to back: every batch of the first, then the second, and so on.
///
/// The combined cardinality of a split is the sum of the member cardinalities, so one
/// full pass visits each member once.
pub struct UnifiedSource {
    name: String,
    sources: Vec<Box<dyn BatchSource>>,
}

impl std::fmt::Debug for UnifiedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedSource").field("name", &self.name).finish_non_exhaustive()
    }
}

impl UnifiedSource {
    pub fn new(sources: Vec<Box<dyn BatchSource>>) -> Result<Self, ConfigurationError> {
        let Some(first) = sources.first() else {
            return Err(ConfigurationError::InvalidValue {
                field: "datasets",
                reason: "at least one source is required".to_string(),
            });
        };

        for source in &sources[1..] {
            let context = format!("source '{}' against '{}'", source.name(), first.name());
            first.labels().ensure_matches(source.labels(), &context)?;
            if source.img_dim() != first.img_dim() {
                return Err(ConfigurationError::ResolutionMismatch {
                    context,
                    expected: first.img_dim(),
                    found: source.img_dim(),
                });
            }
        }

        let name = sources
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join("+");

        let unified = Self { name, sources };
        for split in [Split::Training, Split::Validation] {
            info!(
                "unified {} split: {} batches from {:?}",
                split,
                unified.cardinality(split),
                unified.cardinalities(split)
            );
        }

        Ok(unified)
    }

    /// Opens every dataset directory with the same options, in order.
    pub fn open(
        datasets: &[DatasetConfig],
        labels: &LabelSpace,
        options: SourceOptions,
    ) -> Result<Self, ConfigurationError> {
        let mut sources: Vec<Box<dyn BatchSource>> = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            sources.push(Box::new(DatasetSource::open(dataset, labels, options.clone())?));
        }
        Self::new(sources)
    }

    pub fn cardinalities(&self, split: Split) -> Vec<usize> {
        self.sources.iter().map(|s| s.cardinality(split)).collect()
    }

    /// Member and member-local index of combined batch `index`.
    fn locate(&self, split: Split, index: usize) -> Option<(&dyn BatchSource, usize)> {
        let mut offset = index;
        for source in &self.sources {
            let cardinality = source.cardinality(split);
            if offset < cardinality {
                return Some((source.as_ref(), offset));
            }
            offset -= cardinality;
        }
        None
    }
}

impl BatchSource for UnifiedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &LabelSpace {
        self.sources[0].labels()
    }

    fn img_dim(&self) -> usize {
        self.sources[0].img_dim()
    }

    fn cardinality(&self, split: Split) -> usize {
        self.sources.iter().map(|s| s.cardinality(split)).sum()
    }

    fn batch(
        &self,
        split: Split,
        epoch: usize,
        index: usize,
    ) -> Result<Vec<WasteItem>, DataPipelineError> {
        let (source, local) = self
            .locate(split, index)
            .ok_or_else(|| DataPipelineError::CorruptBatch {
                dataset: self.name.clone(),
                split,
                index,
                reason: format!("only {} batches per epoch", self.cardinality(split)),
            })?;

        source.batch(split, epoch, local)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::source::BatchStream;

    /// Batches tagged with the source id in the label and the local index in the pixels.
    struct FakeSource {
        name: String,
        id: usize,
        batches: usize,
        labels: LabelSpace,
        img_dim: usize,
        pulls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn boxed(id: usize, batches: usize) -> (Box<dyn BatchSource>, Arc<AtomicUsize>) {
            let pulls = Arc::new(AtomicUsize::new(0));
            let source = FakeSource {
                name: format!("fake{id}"),
                id,
                batches,
                labels: LabelSpace::waste(),
                img_dim: 4,
                pulls: pulls.clone(),
            };
            (Box::new(source), pulls)
        }
    }

    impl BatchSource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn labels(&self) -> &LabelSpace {
            &self.labels
        }

        fn img_dim(&self) -> usize {
            self.img_dim
        }

        fn cardinality(&self, _split: Split) -> usize {
            self.batches
        }

        fn batch(
            &self,
            _split: Split,
            _epoch: usize,
            index: usize,
        ) -> Result<Vec<WasteItem>, DataPipelineError> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![WasteItem {
                image: vec![index as f32],
                label: self.id,
            }])
        }
    }

    #[test]
    fn cardinality_is_the_sum() {
        let (a, _) = FakeSource::boxed(0, 10);
        let (b, _) = FakeSource::boxed(1, 4);
        let (c, _) = FakeSource::boxed(2, 6);
        let unified = UnifiedSource::new(vec![a, b, c]).unwrap();

        assert_eq!(unified.cardinality(Split::Training), 20);
        assert_eq!(unified.cardinalities(Split::Validation), vec![10, 4, 6]);
    }

    #[test]
    fn short_run_only_reaches_the_first_source() {
        let (a, pulls_a) = FakeSource::boxed(0, 10);
        let (b, pulls_b) = FakeSource::boxed(1, 4);
        let (c, pulls_c) = FakeSource::boxed(2, 6);
        let unified = UnifiedSource::new(vec![a, b, c]).unwrap();

        let drawn: Vec<_> = BatchStream::new(&unified, Split::Training)
            .take(10)
            .map(|batch| batch.unwrap())
            .collect();

        assert!(drawn.iter().all(|batch| batch[0].label == 0));
        assert_eq!(pulls_a.load(Ordering::SeqCst), 10);
        assert_eq!(pulls_b.load(Ordering::SeqCst), 0);
        assert_eq!(pulls_c.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_pass_visits_sources_in_order() {
        let (a, _) = FakeSource::boxed(0, 2);
        let (b, _) = FakeSource::boxed(1, 3);
        let unified = UnifiedSource::new(vec![a, b]).unwrap();

        let mut stream = BatchStream::new(&unified, Split::Training);
        let tags: Vec<(usize, f32)> = stream
            .by_ref()
            .take(6)
            .map(|batch| {
                let item = &batch.unwrap()[0];
                (item.label, item.image[0])
            })
            .collect();

        assert_eq!(
            tags,
            vec![(0, 0.0), (0, 1.0), (1, 0.0), (1, 1.0), (1, 2.0), (0, 0.0)]
        );
        assert_eq!(stream.epoch(), 1);
    }

    #[test]
    fn rejects_mismatched_resolution() {
        let (a, _) = FakeSource::boxed(0, 2);
        let b = FakeSource {
            name: "big".to_string(),
            id: 1,
            batches: 2,
            labels: LabelSpace::waste(),
            img_dim: 8,
            pulls: Arc::default(),
        };
        let err = UnifiedSource::new(vec![a, Box::new(b)]).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::ResolutionMismatch {
                expected: 4,
                found: 8,
                ..
            }
        ));
    }

    #[test]
    fn rejects_mismatched_labels() {
        let (a, _) = FakeSource::boxed(0, 2);
        let b = FakeSource {
            name: "reordered".to_string(),
            id: 1,
            batches: 2,
            labels: LabelSpace::new(&["paper", "glass", "cardboard", "plastic", "metal", "trash"])
                .unwrap(),
            img_dim: 4,
            pulls: Arc::default(),
        };
        let err = UnifiedSource::new(vec![a, Box::new(b)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::LabelSpaceMismatch { .. }));
    }

    #[test]
    fn rejects_empty_list() {
        assert!(UnifiedSource::new(Vec::new()).is_err());
    }
}
