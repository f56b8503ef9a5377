use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Waste categories, in the order the classifier head emits them.
pub const WASTE_LABELS: [&str; 6] = ["glass", "paper", "cardboard", "plastic", "metal", "trash"];

/// Ordered set of target classes shared by every dataset and the model head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpace {
    names: Vec<String>,
}

impl LabelSpace {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigurationError> {
        if names.is_empty() {
            return Err(ConfigurationError::InvalidLabelSpace(
                "at least one class is required".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if name.is_empty() {
                return Err(ConfigurationError::InvalidLabelSpace(
                    "class names must not be empty".to_string(),
                ));
            }
            if seen.iter().any(|existing: &String| existing == name) {
                return Err(ConfigurationError::InvalidLabelSpace(format!(
                    "duplicate class '{name}'"
                )));
            }
            seen.push(name.to_string());
        }

        Ok(Self { names: seen })
    }

    /// The six waste categories.
    pub fn waste() -> Self {
        Self {
            names: WASTE_LABELS.iter().map(|name| name.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Fails unless `other` holds the same classes in the same order.
    pub fn ensure_matches(
        &self,
        other: &LabelSpace,
        context: &str,
    ) -> Result<(), ConfigurationError> {
        if self == other {
            return Ok(());
        }
        Err(ConfigurationError::LabelSpaceMismatch {
            context: context.to_string(),
            expected: self.names.clone(),
            found: other.names.clone(),
        })
    }
}

impl Default for LabelSpace {
    fn default() -> Self {
        Self::waste()
    }
}

/// Table from on-disk class folder name to label index for one dataset.
///
/// Folders named exactly like a label map to it; any other folder needs an explicit
/// alias. Names with neither are rejected instead of being bucketed somewhere.
#[derive(Debug, Clone)]
pub struct ClassMap {
    dataset: String,
    entries: BTreeMap<String, usize>,
}

impl ClassMap {
    pub fn new(
        dataset: &str,
        labels: &LabelSpace,
        aliases: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigurationError> {
        let mut entries: BTreeMap<String, usize> = labels
            .names()
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();

        for (folder, label) in aliases {
            let index = labels
                .index_of(label)
                .ok_or_else(|| ConfigurationError::UnknownLabel {
                    dataset: dataset.to_string(),
                    folder: folder.clone(),
                    label: label.clone(),
                })?;
            entries.insert(folder.clone(), index);
        }

        Ok(Self {
            dataset: dataset.to_string(),
            entries,
        })
    }

    pub fn resolve(&self, folder: &str) -> Result<usize, ConfigurationError> {
        self.entries
            .get(folder)
            .copied()
            .ok_or_else(|| ConfigurationError::UnmappedClass {
                dataset: self.dataset.clone(),
                folder: folder.to_string(),
            })
    }
}
