use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array3, ArrayD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;


#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("empty image")]
    Empty,

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

    #[error("invalid preprocess config: {0}")]
    Invalid(String),
}

/// How images are turned into model input; written next to the model at
/// export time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub img_size: u32,
    pub normalize_mean: [f32; 3],
    pub normalize_std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        PreprocessConfig {
            img_size: 160,
            normalize_mean: [0.485, 0.456, 0.406],
            normalize_std: [0.229, 0.224, 0.225],
        }
    }
}

impl PreprocessConfig {
    pub fn load_or_default(path: &Path) -> Result<Self, PreprocessError> {
        if !path.exists() {
            info!(
                "No preprocess config at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| PreprocessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PreprocessConfig =
            serde_json::from_str(&raw).map_err(|source| PreprocessError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        info!("Loaded preprocess config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PreprocessError> {
        if self.img_size == 0 {
            return Err(PreprocessError::Invalid("img_size must be positive".to_string()));
        }
        if let Some(bad) = self.normalize_std.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(PreprocessError::Invalid(format!(
                "normalize_std values must be positive, got {bad}"
            )));
        }
        if self.normalize_mean.iter().any(|m| !m.is_finite()) {
            return Err(PreprocessError::Invalid(
                "normalize_mean values must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn decode(&self, image_data: &[u8]) -> Result<DynamicImage, PreprocessError> {
        if image_data.is_empty() {
            return Err(PreprocessError::Empty);
        }
        Ok(image::load_from_memory(image_data)?)
    }

    /// Square resize, scale to [0, 1], normalize per channel, CHW layout.
    pub fn to_tensor(&self, image: &DynamicImage) -> ArrayD<f32> {
        let size = self.img_size;
        let rgb = image
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let mut tensor = Array3::<f32>::zeros((3, size as usize, size as usize));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[c, y as usize, x as usize]] =
                    (value - self.normalize_mean[c]) / self.normalize_std[c];
            }
        }
        tensor.into_dyn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    impl PreprocessConfig {
        fn preprocess(&self, image_data: &[u8]) -> Result<ArrayD<f32>, PreprocessError> {
            let image = self.decode(image_data)?;
            Ok(self.to_tensor(&image))
        }
    }

    fn png_bytes(width: u32, height: u32, colour: [u8; 3]) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, Rgb(colour));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn tensor_is_chw_at_configured_size() {
        let config = PreprocessConfig {
            img_size: 8,
            ..Default::default()
        };
        let tensor = config.preprocess(&png_bytes(20, 10, [0, 0, 0])).unwrap();
        assert_eq!(tensor.shape(), &[3, 8, 8]);
    }

    #[test]
    fn channels_are_normalized() {
        let config = PreprocessConfig {
            img_size: 4,
            normalize_mean: [0.5, 0.5, 0.5],
            normalize_std: [0.5, 0.5, 0.5],
        };
        let tensor = config
            .preprocess(&png_bytes(4, 4, [255, 0, 255]))
            .unwrap()
            .into_dimensionality::<ndarray::Ix3>()
            .unwrap();
        assert!((tensor[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[1, 2, 2]] + 1.0).abs() < 1e-6);
        assert!((tensor[[2, 3, 3]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let config = PreprocessConfig::default();
        assert!(matches!(
            config.preprocess(b"not an image"),
            Err(PreprocessError::Decode(_))
        ));
        assert!(matches!(config.preprocess(&[]), Err(PreprocessError::Empty)));
    }

    #[test]
    fn bad_config_file_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preprocess_config.json");

        std::fs::write(&path, r#"{"img_size": 0}"#).unwrap();
        assert!(matches!(
            PreprocessConfig::load_or_default(&path),
            Err(PreprocessError::Invalid(_))
        ));

        std::fs::write(&path, r#"{"normalize_std": [0.2, 0.0, 0.2]}"#).unwrap();
        assert!(matches!(
            PreprocessConfig::load_or_default(&path),
            Err(PreprocessError::Invalid(_))
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            PreprocessConfig::load_or_default(&path),
            Err(PreprocessError::Json { .. })
        ));

        std::fs::write(&path, r#"{"img_size": 224}"#).unwrap();
        assert_eq!(PreprocessConfig::load_or_default(&path).unwrap().img_size, 224);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PreprocessConfig::load_or_default(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, PreprocessConfig::default());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: PreprocessConfig = serde_json::from_str(r#"{"img_size": 224}"#).unwrap();
        assert_eq!(config.img_size, 224);
        assert_eq!(config.normalize_std, [0.229, 0.224, 0.225]);
    }
}
