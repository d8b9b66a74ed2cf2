use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::StartupError;

/// Index to disease label table, immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable {
    labels: Vec<String>,
}

/// The two accepted shapes of the label file.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClassFile {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl ClassTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StartupError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StartupError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let table = Self::from_json(&raw)?;
        info!("Loaded {} classes from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn from_json(raw: &str) -> Result<Self, StartupError> {
        let parsed: ClassFile = serde_json::from_str(raw).map_err(|_| {
            StartupError::Configuration(
                "class file must be a JSON list of labels or an index-to-label object".into(),
            )
        })?;

        let labels = match parsed {
            ClassFile::List(labels) => labels,
            ClassFile::Map(entries) => {
                let mut indexed = BTreeMap::new();
                for (key, label) in entries {
                    let idx = key.trim().parse::<usize>().map_err(|_| {
                        StartupError::Configuration(format!("class index `{}` is not a number", key))
                    })?;
                    if indexed.insert(idx, label).is_some() {
                        return Err(StartupError::Configuration(format!(
                            "class index {} appears more than once",
                            idx
                        )));
                    }
                }
                // BTreeMap iterates in key order, so contiguity is a position check
                for (position, idx) in indexed.keys().enumerate() {
                    if *idx != position {
                        return Err(StartupError::Configuration(format!(
                            "class indices must cover 0..{} without gaps, missing {}",
                            indexed.len(),
                            position
                        )));
                    }
                }
                indexed.into_values().collect()
            }
        };

        if labels.is_empty() {
            return Err(StartupError::Configuration("class file is empty".into()));
        }
        Ok(Self { labels })
    }

    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(String::as_str)
    }
}
