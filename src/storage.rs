use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

const DETECTIONS_TABLE: &str = "detections";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("storage backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("invalid storage credentials: {0}")]
    Credentials(String),
}

/// A persisted detection row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub image_url: String,
    pub heatmap_url: Option<String>,
    pub pest_name: String,
    /// Fraction in [0, 1].
    pub confidence: f64,
    pub crop_name: Option<String>,
    pub diagnosis: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Shape the mobile app reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionView {
    pub id: String,
    pub prediction: String,
    pub confidence: f64,
    pub image_url: String,
    pub heatmap_url: Option<String>,
    pub diagnosis: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub crop_name: Option<String>,
}

impl From<Detection> for DetectionView {
    fn from(d: Detection) -> Self {
        DetectionView {
            id: d.id,
            prediction: d.pest_name,
            confidence: d.confidence,
            image_url: d.image_url,
            heatmap_url: d.heatmap_url,
            diagnosis: d.diagnosis,
            timestamp: d.created_at,
            crop_name: d.crop_name,
        }
    }
}

/// Supabase storage + PostgREST.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl SupabaseStore {
    pub fn new(base_url: &str, key: &str, bucket: &str) -> Result<Self, StorageError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| StorageError::Credentials(e.to_string()))?;
        let apikey =
            HeaderValue::from_str(key).map_err(|e| StorageError::Credentials(e.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("apikey", apikey);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(SupabaseStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        })
    }

    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, DETECTIONS_TABLE)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Backend {
            status: status.as_u16(),
            body,
        })
    }

    async fn upload_object(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, path
        );
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(self.public_url(path))
    }

    async fn insert(&self, detection: &Detection) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.table_url())
            .header("Prefer", "return=minimal")
            .json(detection)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn history(&self) -> Result<Vec<Detection>, StorageError> {
        let response = self
            .client
            .get(self.table_url())
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get(&self, id: &str) -> Result<Option<Detection>, StorageError> {
        let filter = format!("eq.{id}");
        let response = self
            .client
            .get(self.table_url())
            .query(&[("select", "*"), ("id", filter.as_str())])
            .send()
            .await?;
        let rows: Vec<Detection> = Self::check(response).await?.json().await?;
        Ok(rows.into_iter().next())
    }
}

/// In-process store for local runs without Supabase, and for tests.
#[derive(Default)]
pub struct MemoryStore {
    detections: RwLock<Vec<Detection>>,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    #[cfg(test)]
    reject_prefix: Option<String>,
}

#[cfg(test)]
impl MemoryStore {
    /// Fails every object upload whose path starts with `prefix`.
    pub fn rejecting(prefix: &str) -> Self {
        MemoryStore {
            reject_prefix: Some(prefix.to_string()),
            ..Default::default()
        }
    }

    pub async fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(path).cloned()
    }

    fn check_path(&self, path: &str) -> Result<(), StorageError> {
        match &self.reject_prefix {
            Some(prefix) if path.starts_with(prefix.as_str()) => Err(StorageError::Backend {
                status: 500,
                body: format!("upload to {path} rejected"),
            }),
            _ => Ok(()),
        }
    }
}

pub enum DetectionStore {
    Supabase(SupabaseStore),
    Memory(MemoryStore),
}

impl DetectionStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            DetectionStore::Supabase(_) => "supabase",
            DetectionStore::Memory(_) => "memory",
        }
    }

    /// Stores `bytes` under `path` and returns its public URL.
    pub async fn upload_object(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        debug!("Uploading {} bytes to {}", bytes.len(), path);
        match self {
            DetectionStore::Supabase(store) => store.upload_object(path, bytes, content_type).await,
            DetectionStore::Memory(store) => {
                #[cfg(test)]
                store.check_path(path)?;
                store.objects.write().await.insert(path.to_string(), bytes);
                Ok(format!("memory://{path}"))
            }
        }
    }

    pub async fn insert(&self, detection: &Detection) -> Result<(), StorageError> {
        match self {
            DetectionStore::Supabase(store) => store.insert(detection).await,
            DetectionStore::Memory(store) => {
                store.detections.write().await.push(detection.clone());
                Ok(())
            }
        }
    }

    /// All detections, newest first.
    pub async fn history(&self) -> Result<Vec<Detection>, StorageError> {
        match self {
            DetectionStore::Supabase(store) => store.history().await,
            DetectionStore::Memory(store) => {
                let mut rows = store.detections.read().await.clone();
                rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(rows)
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Detection>, StorageError> {
        match self {
            DetectionStore::Supabase(store) => store.get(id).await,
            DetectionStore::Memory(store) => Ok(store
                .detections
                .read()
                .await
                .iter()
                .find(|d| d.id == id)
                .cloned()),
        }
    }
}
