use std::path::Path;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::info;

use crate::config::ArtifactConfig;

async fn download_file(url: &str, path: &Path, github_token: Option<&str>) -> Result<()> {
    info!("Downloading {} from {}", path.display(), url);

    let mut header_map = HeaderMap::new();

    if let Some(token) = github_token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Invalid GITHUB_TOKEN format")?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .with_context(|| format!("Failed to send request to {url}"))?;

    if !response.status().is_success() {
        bail!("Failed to download {}: {}", url, response.status());
    }

    let bytes = response.bytes().await.context("Failed to read bytes")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Fetches a missing artifact when a URL is configured.
async fn ensure_file(path: &Path, url: Option<&str>, token: Option<&str>) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    match url {
        Some(url) => download_file(url, path, token).await,
        None => bail!("{} not found and no download URL configured", path.display()),
    }
}

pub async fn ensure_files_exist(artifacts: &ArtifactConfig) -> Result<()> {
    info!("Checking model artifacts...");
    let token = artifacts.github_token.as_deref();

    ensure_file(&artifacts.model_path, artifacts.model_url.as_deref(), token).await?;
    ensure_file(&artifacts.class_map_path, artifacts.class_map_url.as_deref(), token).await?;
    ensure_file(&artifacts.crop_map_path, artifacts.crop_map_url.as_deref(), token).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_file_needs_no_url() {
        let file = tempfile::NamedTempFile::new().unwrap();
        ensure_file(file.path(), None, None).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_without_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        assert!(ensure_file(&path, None, None).await.is_err());
    }
}
