use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array1, Array4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use tracing::info;

use crate::inference::InferenceError;

/// One named tensor handed to the runtime.
#[derive(Debug, Clone)]
pub struct Feed {
    pub name: String,
    pub value: FeedValue,
}

#[derive(Debug, Clone)]
pub enum FeedValue {
    Image(Array4<f32>),
    CropId(Array1<i64>),
}

/// How the image (and crop id) are handed to the model, decided once from
/// the declared input names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSignature {
    /// `image` + `crop_id`: the graph conditions on the crop itself.
    ImageAndCrop,
    /// Legacy single tensor named `input`.
    Legacy,
    /// Anything else: the image goes to the first declared input.
    FirstInput(String),
}

impl InputSignature {
    pub fn probe(input_names: &[String]) -> Result<Self, InferenceError> {
        let has = |wanted: &str| input_names.iter().any(|n| n == wanted);

        if has("image") && has("crop_id") {
            Ok(InputSignature::ImageAndCrop)
        } else if has("input") {
            Ok(InputSignature::Legacy)
        } else if let Some(first) = input_names.first() {
            Ok(InputSignature::FirstInput(first.clone()))
        } else {
            Err(InferenceError::NoInputs)
        }
    }

    pub fn feeds(&self, image: Array4<f32>, crop_id: usize) -> Vec<Feed> {
        match self {
            InputSignature::ImageAndCrop => vec![
                Feed {
                    name: "image".to_string(),
                    value: FeedValue::Image(image),
                },
                Feed {
                    name: "crop_id".to_string(),
                    value: FeedValue::CropId(Array1::from_vec(vec![crop_id as i64])),
                },
            ],
            InputSignature::Legacy => vec![Feed {
                name: "input".to_string(),
                value: FeedValue::Image(image),
            }],
            InputSignature::FirstInput(name) => vec![Feed {
                name: name.clone(),
                value: FeedValue::Image(image),
            }],
        }
    }

    pub fn takes_crop_id(&self) -> bool {
        matches!(self, InputSignature::ImageAndCrop)
    }
}

/// The forward pass, behind a seam so the pipeline can run against a fake
/// graph in tests.
pub trait ModelRuntime: Send + Sync {
    fn input_names(&self) -> &[String];

    /// Runs one batch and returns the first output flattened.
    fn run(&self, feeds: Vec<Feed>) -> Result<Vec<f32>, InferenceError>;
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> InferenceError {
    InferenceError::ModelLoad(format!("{}: {e}", path.display()))
}

fn runtime_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Runtime(e.to_string())
}

pub struct OrtModel {
    // Session::run needs &mut in ort rc.10
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_name: String,
}

impl OrtModel {
    pub fn load(model_path: &Path) -> Result<Self, InferenceError> {
        let session = Session::builder()
            .map_err(|e| load_error(model_path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(model_path, e))?
            .commit_from_file(model_path)
            .map_err(|e| load_error(model_path, e))?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| InferenceError::ModelLoad("model declares no outputs".to_string()))?;

        info!(
            "Loaded model from {} (inputs: {:?}, output: {})",
            model_path.display(),
            input_names,
            output_name
        );

        Ok(OrtModel {
            session: Mutex::new(session),
            input_names,
            output_name,
        })
    }
}

impl ModelRuntime for OrtModel {
    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn run(&self, feeds: Vec<Feed>) -> Result<Vec<f32>, InferenceError> {
        let mut inputs: Vec<(String, DynValue)> = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let value = match feed.value {
                FeedValue::Image(image) => Tensor::from_array(image).map_err(runtime_error)?.into_dyn(),
                FeedValue::CropId(crop_id) => {
                    Tensor::from_array(crop_id).map_err(runtime_error)?.into_dyn()
                }
            };
            inputs.push((feed.name, value));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| InferenceError::Runtime("model session lock poisoned".to_string()))?;
        let outputs = session.run(inputs).map_err(runtime_error)?;
        let (_, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(runtime_error)?;

        Ok(data.to_vec())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn probes_two_input_signature() {
        let sig = InputSignature::probe(&names(&["crop_id", "image"])).unwrap();
        assert_eq!(sig, InputSignature::ImageAndCrop);
        assert!(sig.takes_crop_id());
    }

    #[test]
    fn probes_legacy_signature() {
        let sig = InputSignature::probe(&names(&["input"])).unwrap();
        assert_eq!(sig, InputSignature::Legacy);
        assert!(!sig.takes_crop_id());
    }

    #[test]
    fn image_without_crop_id_uses_first_input() {
        let sig = InputSignature::probe(&names(&["image"])).unwrap();
        assert_eq!(sig, InputSignature::FirstInput("image".to_string()));
    }

    #[test]
    fn no_inputs_is_fatal() {
        assert!(matches!(
            InputSignature::probe(&[]),
            Err(InferenceError::NoInputs)
        ));
    }

    #[test]
    fn two_input_feeds_carry_crop_id() {
        let image = Array4::<f32>::zeros((1, 3, 2, 2));
        let feeds = InputSignature::ImageAndCrop.feeds(image, 7);
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].name, "image");
        match &feeds[1].value {
            FeedValue::CropId(ids) => assert_eq!(ids.to_vec(), vec![7]),
            other => panic!("unexpected feed {other:?}"),
        }
    }
}
