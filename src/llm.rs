use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Client for a local Ollama server.
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(OllamaClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    /// Explanation text for a detection. Never fails: any transport or
    /// decoding error yields [`fallback_text`].
    pub async fn diagnose(
        &self,
        image_url: &str,
        disease: &str,
        confidence: f64,
        crop_name: Option<&str>,
    ) -> String {
        let prompt = build_prompt(image_url, disease, confidence, crop_name);
        match self.generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("Ollama returned an empty response");
                fallback_text(disease, confidence)
            }
            Err(e) => {
                warn!("Error calling Ollama API: {}", e);
                fallback_text(disease, confidence)
            }
        }
    }

    async fn generate(&self, prompt: &str) -> reqwest::Result<String> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let response: GenerateResponse = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.response)
    }
}

pub fn build_prompt(
    image_url: &str,
    disease: &str,
    confidence: f64,
    crop_name: Option<&str>,
) -> String {
    let crop_info = match crop_name {
        Some(crop) => format!("{crop} crop"),
        None => "crop".to_string(),
    };
    let pct = confidence * 100.0;

    format!(
        "A farmer uploaded an image of a {crop_info}. Our AI model detected '{disease}' with {pct:.1}% confidence.\n\
         Image URL: {image_url}\n\n\
         Please provide a detailed response with the following information:\n\
         1. What is {disease} and how does it affect {crop_info}?\n\
         2. What are the typical symptoms that can be observed?\n\
         3. What are the recommended treatments or management practices?\n\
         4. What preventive measures can farmers take to avoid this issue in the future?\n\n\
         Keep your response concise but informative, focusing on practical advice for farmers."
    )
}

pub fn fallback_text(disease: &str, confidence: f64) -> String {
    format!(
        "Detected {} with {:.1}% confidence. Unable to generate detailed diagnosis at this time.",
        disease,
        confidence * 100.0
    )
}

pub fn is_fallback(text: &str) -> bool {
    text.contains("Unable to generate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_crop_and_percentage() {
        let prompt = build_prompt("http://img", "tomato_early_blight", 0.873, Some("tomato"));
        assert!(prompt.contains("image of a tomato crop"));
        assert!(prompt.contains("with 87.3% confidence"));
        assert!(prompt.contains("Image URL: http://img"));

        let prompt = build_prompt("http://img", "x", 0.5, None);
        assert!(prompt.contains("image of a crop."));
    }

    #[tokio::test]
    async fn unreachable_server_yields_fallback() {
        let client =
            OllamaClient::new("http://127.0.0.1:9", "llama3", Duration::from_millis(500)).unwrap();
        let text = client.diagnose("http://img", "rice_brown_spot", 0.42, None).await;
        assert_eq!(text, fallback_text("rice_brown_spot", 0.42));
        assert!(is_fallback(&text));
    }
}
