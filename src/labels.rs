use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("key {0:?} is not a non-negative integer")]
    InvalidKey(String),

    #[error("index map is missing key {0}")]
    MissingIndex(usize),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, LabelError> {
    let raw = fs::read_to_string(path).map_err(|source| LabelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| LabelError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Turns `{"0": "a", "1": "b"}` into `["a", "b"]`. Keys must cover 0..n.
fn ordered_by_index(map: BTreeMap<String, String>) -> Result<Vec<String>, LabelError> {
    let mut indexed = BTreeMap::new();
    for (key, value) in map {
        let idx = key
            .trim()
            .parse::<usize>()
            .map_err(|_| LabelError::InvalidKey(key.clone()))?;
        indexed.insert(idx, value);
    }

    let mut out = Vec::with_capacity(indexed.len());
    for (expected, (idx, value)) in indexed.into_iter().enumerate() {
        if idx != expected {
            return Err(LabelError::MissingIndex(expected));
        }
        out.push(value);
    }
    Ok(out)
}

/// Disease names indexed by global class index.
#[derive(Debug, Clone, Default)]
pub struct ClassLabelTable {
    labels: Vec<String>,
}

impl ClassLabelTable {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let labels = ordered_by_index(read_json(path)?)?;
        info!("Loaded {} class labels from {}", labels.len(), path.display());
        Ok(Self { labels })
    }

    pub fn get(&self, global_idx: usize) -> Option<&str> {
        self.labels.get(global_idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

/// Crop names indexed by crop id.
#[derive(Debug, Clone, Default)]
pub struct CropLabelTable {
    crops: Vec<String>,
}

impl CropLabelTable {
    pub fn new(crops: Vec<String>) -> Self {
        Self { crops }
    }

    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let crops = ordered_by_index(read_json(path)?)?;
        info!("Loaded {} crop labels from {}", crops.len(), path.display());
        Ok(Self { crops })
    }

    /// Exact, case-insensitive lookup.
    pub fn crop_id(&self, name: &str) -> Option<usize> {
        let wanted = name.to_lowercase();
        self.crops.iter().position(|c| c.to_lowercase() == wanted)
    }

    pub fn name(&self, crop_id: usize) -> Option<&str> {
        self.crops.get(crop_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.crops.len()
    }
}

/// A crop's slice of the concatenated model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBlock<'a> {
    pub start: usize,
    pub global_classes: &'a [usize],
}

impl CropBlock<'_> {
    pub fn len(&self) -> usize {
        self.global_classes.len()
    }

    pub fn end(&self) -> usize {
        self.start + self.len()
    }
}

/// Valid global classes per crop. Keys stay strings and iterate in string
/// order, which is the order the per-crop heads were concatenated at export
/// ("10" sorts before "2").
#[derive(Debug, Clone, Default)]
pub struct CropToGlobalClasses {
    blocks: BTreeMap<String, Vec<usize>>,
}

impl CropToGlobalClasses {
    pub fn new(blocks: BTreeMap<String, Vec<usize>>) -> Self {
        Self { blocks }
    }

    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let blocks: BTreeMap<String, Vec<usize>> = read_json(path)?;
        for key in blocks.keys() {
            key.parse::<usize>()
                .map_err(|_| LabelError::InvalidKey(key.clone()))?;
        }
        let mapping = Self { blocks };
        info!(
            "Loaded crop-to-class mapping for {} crops ({} logits) from {}",
            mapping.blocks.len(),
            mapping.total_logits(),
            path.display()
        );
        Ok(mapping)
    }

    /// Loads the mapping if the file exists; a missing file means the model
    /// uses the flat layout.
    pub fn load_optional(path: &Path) -> Result<Option<Self>, LabelError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Offset is the summed length of every block whose key sorts first.
    pub fn block(&self, crop_id: usize) -> Option<CropBlock<'_>> {
        let key = crop_id.to_string();
        let mut start = 0;
        for (k, classes) in &self.blocks {
            if *k == key {
                return Some(CropBlock {
                    start,
                    global_classes: classes,
                });
            }
            start += classes.len();
        }
        None
    }

    pub fn total_logits(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }
}
