//! Crop-aware classification over a multi-head model.
//!
//! The exported graph shares one backbone and has a linear head per crop.
//! Without a `crop_id` input the heads are concatenated into one output
//! vector in string-sorted crop-id order, so the pipeline slices the
//! requested crop's block back out before the softmax and maps the local
//! winner to a global class through [`CropToGlobalClasses`].

use ndarray::{ArrayD, Axis, Ix4};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::labels::{ClassLabelTable, CropLabelTable, CropToGlobalClasses};
use crate::model::{InputSignature, ModelRuntime};

pub const DEFAULT_FALLBACK_SLICE_LEN: usize = 15;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("model declares no inputs")]
    NoInputs,

    #[error("invalid image tensor shape {0:?}: expected [3, H, W] or [1, 3, H, W]")]
    InvalidShape(Vec<usize>),

    #[error("inference failed: {0}")]
    Runtime(String),

    #[error("model output has {actual} values, crop block needs {expected}")]
    OutputTooShort { expected: usize, actual: usize },

    #[error("model produced no scores")]
    EmptyScores,

    #[error("no class mapping for crop id {0}")]
    UnmappedCrop(usize),
}

/// What to do when the requested crop has no entry in the crop-to-class map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingCropPolicy {
    /// Score the first `n` output values and report a degraded result.
    FallbackSlice(usize),
    Reject,
}

impl Default for MissingCropPolicy {
    fn default() -> Self {
        MissingCropPolicy::FallbackSlice(DEFAULT_FALLBACK_SLICE_LEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    Flat,
    Concatenated,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    pub global_class_idx: usize,
    pub local_class_idx: usize,
    pub label: String,
    /// Fraction in [0, 1].
    pub confidence: f64,
    pub raw_scores: Vec<f32>,
    pub probabilities: Vec<f64>,
    pub crop_id: usize,
    pub crop_name: String,
    /// Set when any step fell back to a default value.
    pub degraded: bool,
}

/// The slice of the model output that belongs to the requested crop.
struct Selection<'a> {
    scores: &'a [f32],
    global_classes: Option<&'a [usize]>,
    degraded: bool,
}

pub struct CropClassifier {
    runtime: Box<dyn ModelRuntime>,
    signature: InputSignature,
    classes: ClassLabelTable,
    crops: CropLabelTable,
    crop_classes: Option<CropToGlobalClasses>,
    missing_crop_policy: MissingCropPolicy,
}

impl CropClassifier {
    pub fn new(
        runtime: Box<dyn ModelRuntime>,
        classes: ClassLabelTable,
        crops: CropLabelTable,
        crop_classes: Option<CropToGlobalClasses>,
        missing_crop_policy: MissingCropPolicy,
    ) -> Result<Self, InferenceError> {
        let signature = InputSignature::probe(runtime.input_names())?;
        let crop_classes = crop_classes.filter(|m| !m.is_empty());

        Ok(CropClassifier {
            runtime,
            signature,
            classes,
            crops,
            crop_classes,
            missing_crop_policy,
        })
    }

    pub fn signature(&self) -> &InputSignature {
        &self.signature
    }

    pub fn classes(&self) -> &ClassLabelTable {
        &self.classes
    }

    pub fn crops(&self) -> &CropLabelTable {
        &self.crops
    }

    pub fn layout(&self) -> OutputLayout {
        match (&self.crop_classes, &self.signature) {
            (Some(_), InputSignature::FirstInput(_)) => OutputLayout::Concatenated,
            _ => OutputLayout::Flat,
        }
    }

    /// Crop id for `name`, or 0 when the name is unknown. The flag is set on
    /// the fallback.
    pub fn resolve_crop(&self, crop_name: Option<&str>) -> (usize, bool) {
        let Some(name) = crop_name else {
            return (0, false);
        };
        match self.crops.crop_id(name) {
            Some(id) => (id, false),
            None => {
                warn!("Crop '{}' not found in crop labels, using default (0)", name);
                (0, true)
            }
        }
    }

    pub fn predict(
        &self,
        image: ArrayD<f32>,
        crop_name: Option<&str>,
    ) -> Result<InferenceResult, InferenceError> {
        let image = batch_of_one(image)?;
        let (crop_id, mut degraded) = self.resolve_crop(crop_name);

        let output = self.runtime.run(self.signature.feeds(image, crop_id))?;
        let selection = self.select_scores(&output, crop_id)?;
        degraded |= selection.degraded;

        if selection.scores.is_empty() {
            return Err(InferenceError::EmptyScores);
        }

        let probabilities = softmax(selection.scores);
        let local_class_idx = argmax(&probabilities);
        let confidence = probabilities[local_class_idx];
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };

        let global_class_idx = selection
            .global_classes
            .and_then(|g| g.get(local_class_idx).copied())
            .unwrap_or(local_class_idx);

        let label = match self.classes.get(global_class_idx) {
            Some(label) => label.to_string(),
            None => {
                warn!(
                    "Global class {} outside label table ({} labels)",
                    global_class_idx,
                    self.classes.len()
                );
                degraded = true;
                format!("class_{local_class_idx}")
            }
        };

        let crop_name = self.crops.name(crop_id).unwrap_or("default").to_string();
        debug!(
            "Predicted {} ({:.4}) for crop {} [{:?} layout]",
            label,
            confidence,
            crop_name,
            self.layout()
        );

        Ok(InferenceResult {
            global_class_idx,
            local_class_idx,
            label,
            confidence,
            raw_scores: selection.scores.to_vec(),
            probabilities,
            crop_id,
            crop_name,
            degraded,
        })
    }

    fn select_scores<'a>(
        &'a self,
        output: &'a [f32],
        crop_id: usize,
    ) -> Result<Selection<'a>, InferenceError> {
        let mapping = match (self.layout(), &self.crop_classes) {
            (OutputLayout::Concatenated, Some(mapping)) => mapping,
            _ => {
                return Ok(Selection {
                    scores: output,
                    global_classes: None,
                    degraded: false,
                })
            }
        };

        // Blocks laid end to end must cover the whole output; anything else
        // means the mapping and the exported heads disagree.
        let misaligned = output.len() != mapping.total_logits();
        if misaligned {
            warn!(
                "Model output has {} values but the crop mapping covers {}",
                output.len(),
                mapping.total_logits()
            );
        }

        match mapping.block(crop_id) {
            Some(block) => {
                if block.end() > output.len() {
                    return Err(InferenceError::OutputTooShort {
                        expected: block.end(),
                        actual: output.len(),
                    });
                }
                Ok(Selection {
                    scores: &output[block.start..block.end()],
                    global_classes: Some(block.global_classes),
                    degraded: misaligned,
                })
            }
            None => match self.missing_crop_policy {
                MissingCropPolicy::FallbackSlice(len) => {
                    warn!(
                        "No class mapping for crop {}, scoring the first {} outputs",
                        crop_id, len
                    );
                    Ok(Selection {
                        scores: &output[..len.min(output.len())],
                        global_classes: None,
                        degraded: true,
                    })
                }
                MissingCropPolicy::Reject => Err(InferenceError::UnmappedCrop(crop_id)),
            },
        }
    }
}

/// Adds the batch axis to a `[3, H, W]` tensor and checks the result is a
/// batch of one 3-channel image.
fn batch_of_one(image: ArrayD<f32>) -> Result<ndarray::Array4<f32>, InferenceError> {
    let shape = image.shape().to_vec();
    let image = match image.ndim() {
        3 => image.insert_axis(Axis(0)),
        4 => image,
        _ => return Err(InferenceError::InvalidShape(shape)),
    };

    let dims = image.shape();
    if dims[0] != 1 || dims[1] != 3 || dims[2] == 0 || dims[3] == 0 {
        return Err(InferenceError::InvalidShape(shape));
    }

    image
        .into_dimensionality::<Ix4>()
        .map_err(|_| InferenceError::InvalidShape(shape))
}

/// Softmax with the max subtracted first so large logits do not overflow.
pub fn softmax(scores: &[f32]) -> Vec<f64> {
    let max = scores
        .iter()
        .map(|&s| s as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|&s| (s as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
