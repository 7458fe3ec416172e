use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::inference::{MissingCropPolicy, DEFAULT_FALLBACK_SLICE_LEN};

#[derive(Error, Debug)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    key: String,
    value: String,
    reason: String,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

/// Where the model and its label artifacts live, and where to fetch them
/// from when they are missing.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub model_path: PathBuf,
    pub class_map_path: PathBuf,
    pub crop_map_path: PathBuf,
    pub crop_to_global_path: PathBuf,
    pub preprocess_config_path: PathBuf,
    pub model_url: Option<String>,
    pub class_map_url: Option<String>,
    pub crop_map_url: Option<String>,
    pub github_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub artifacts: ArtifactConfig,
    /// None runs against the in-memory store.
    pub supabase: Option<SupabaseConfig>,
    pub ollama: Option<OllamaConfig>,
    pub heatmap_enabled: bool,
    pub allowed_origins: Vec<String>,
    pub inference_timeout: Duration,
    pub missing_crop_policy: MissingCropPolicy,
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError {
                key: key.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.trim().to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError {
                key: key.to_string(),
                value: v,
                reason: "expected true or false".to_string(),
            }),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };

        let port = match vars.get("PORT") {
            Some(_) => vars.parse("PORT", 8000u16)?,
            None => vars.parse("API_PORT", 8000u16)?,
        };
        let body_limit_mb: usize = vars.parse("BODY_LIMIT_MB", 10)?;

        let class_map_path = vars.get("CLASS_MAP_PATH").map(PathBuf::from).unwrap_or_else(|| {
            let preferred = Path::new("models/disease_class_map.json");
            if preferred.exists() {
                preferred.to_path_buf()
            } else {
                PathBuf::from("models/class_map.json")
            }
        });

        let artifacts = ArtifactConfig {
            model_path: vars.string("MODEL_PATH", "models/mobilenet.onnx").into(),
            class_map_path,
            crop_map_path: vars.string("CROP_MAP_PATH", "models/crop_map.json").into(),
            crop_to_global_path: vars
                .string("CROP_TO_GLOBAL_PATH", "models/crop_to_global_classes.json")
                .into(),
            preprocess_config_path: vars
                .string("PREPROCESS_CONFIG_PATH", "models/preprocess_config.json")
                .into(),
            model_url: vars.get("MODEL_URL"),
            class_map_url: vars.get("CLASS_MAP_URL"),
            crop_map_url: vars.get("CROP_MAP_URL"),
            github_token: vars.get("GITHUB_TOKEN"),
        };

        let supabase = match (vars.get("SUPABASE_URL"), vars.get("SUPABASE_KEY")) {
            (Some(url), Some(key)) => Some(SupabaseConfig {
                url,
                key,
                bucket: vars.string("STORAGE_BUCKET", "crop-images"),
            }),
            _ => None,
        };

        let ollama = if vars.flag("OLLAMA_ENABLED", true)? {
            Some(OllamaConfig {
                base_url: vars.string("OLLAMA_BASE_URL", "http://localhost:11434"),
                model: vars.string("OLLAMA_MODEL", "llama3"),
                timeout: Duration::from_secs(vars.parse("OLLAMA_TIMEOUT_SECS", 60)?),
            })
        } else {
            None
        };

        let missing_crop_policy = match vars
            .string("MISSING_CROP_POLICY", "fallback")
            .to_lowercase()
            .as_str()
        {
            "fallback" => {
                let len: usize = vars.parse("FALLBACK_SLICE_LEN", DEFAULT_FALLBACK_SLICE_LEN)?;
                if len == 0 {
                    return Err(ConfigError {
                        key: "FALLBACK_SLICE_LEN".to_string(),
                        value: len.to_string(),
                        reason: "must be at least 1".to_string(),
                    });
                }
                MissingCropPolicy::FallbackSlice(len)
            }
            "reject" => MissingCropPolicy::Reject,
            other => {
                return Err(ConfigError {
                    key: "MISSING_CROP_POLICY".to_string(),
                    value: other.to_string(),
                    reason: "expected fallback or reject".to_string(),
                })
            }
        };

        Ok(Config {
            host: vars.string("API_HOST", "0.0.0.0"),
            port,
            body_limit_bytes: body_limit_mb * 1024 * 1024,
            artifacts,
            supabase,
            ollama,
            heatmap_enabled: vars.flag("HEATMAP_ENABLED", true)?,
            allowed_origins: vars
                .string("ALLOWED_ORIGINS", "*")
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            inference_timeout: Duration::from_secs(vars.parse("INFERENCE_TIMEOUT_SECS", 30)?),
            missing_crop_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.body_limit_bytes, 10 * 1024 * 1024);
        assert_eq!(config.artifacts.model_path, PathBuf::from("models/mobilenet.onnx"));
        assert!(config.supabase.is_none());
        assert_eq!(config.ollama.as_ref().unwrap().model, "llama3");
        assert_eq!(config.allowed_origins, vec!["*"]);
        assert_eq!(config.missing_crop_policy, MissingCropPolicy::FallbackSlice(15));
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("PORT", "5020"),
            ("SUPABASE_URL", "https://x.supabase.co"),
            ("SUPABASE_KEY", "secret"),
            ("OLLAMA_ENABLED", "false"),
            ("ALLOWED_ORIGINS", "https://a.app, https://b.app"),
            ("MISSING_CROP_POLICY", "reject"),
        ])
        .unwrap();
        assert_eq!(config.port, 5020);
        assert_eq!(config.supabase.unwrap().bucket, "crop-images");
        assert!(config.ollama.is_none());
        assert_eq!(config.allowed_origins, vec!["https://a.app", "https://b.app"]);
        assert_eq!(config.missing_crop_policy, MissingCropPolicy::Reject);
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = config(&[("PORT", "seventy")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert!(config(&[("HEATMAP_ENABLED", "maybe")]).is_err());
        assert!(config(&[("MISSING_CROP_POLICY", "guess")]).is_err());
    }

    #[test]
    fn fallback_slice_must_be_positive() {
        let err = config(&[("FALLBACK_SLICE_LEN", "0")]).unwrap_err();
        assert!(err.to_string().contains("FALLBACK_SLICE_LEN"));
        let config = config(&[("FALLBACK_SLICE_LEN", "8")]).unwrap();
        assert_eq!(config.missing_crop_policy, MissingCropPolicy::FallbackSlice(8));
    }
}
