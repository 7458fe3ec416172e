use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod diagnosis;
mod error;
mod heatmap;
mod inference;
mod labels;
mod llm;
mod model;
mod preprocess;
mod storage;
mod utils;

use api::AppState;
use config::Config;
use inference::CropClassifier;
use labels::{ClassLabelTable, CropLabelTable, CropToGlobalClasses};
use llm::OllamaClient;
use model::OrtModel;
use preprocess::PreprocessConfig;
use storage::{DetectionStore, MemoryStore, SupabaseStore};
use utils::ensure_files_exist;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ort=warn")),
        )
        .init();

    let config = Config::from_env()?;
    ensure_files_exist(&config.artifacts).await?;

    // Everything is loaded before the listener binds; a bad artifact stops
    // the process here.
    let state = Arc::new(build_state(&config)?);

    let app = api::router(state, config.body_limit_bytes, cors_layer(&config.allowed_origins));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let artifacts = &config.artifacts;

    let classes = ClassLabelTable::load(&artifacts.class_map_path)?;
    let crops = CropLabelTable::load(&artifacts.crop_map_path)?;
    let crop_classes = CropToGlobalClasses::load_optional(&artifacts.crop_to_global_path)?;
    let preprocess = PreprocessConfig::load_or_default(&artifacts.preprocess_config_path)?;

    let model = OrtModel::load(&artifacts.model_path)?;
    let classifier = CropClassifier::new(
        Box::new(model),
        classes,
        crops,
        crop_classes,
        config.missing_crop_policy,
    )?;
    info!(
        "Classifier ready: {:?} signature, {:?} layout",
        classifier.signature(),
        classifier.layout()
    );

    let store = match &config.supabase {
        Some(supabase) => DetectionStore::Supabase(SupabaseStore::new(
            &supabase.url,
            &supabase.key,
            &supabase.bucket,
        )?),
        None => {
            warn!("SUPABASE_URL/SUPABASE_KEY not set, detections are kept in memory");
            DetectionStore::Memory(MemoryStore::default())
        }
    };

    let llm = match &config.ollama {
        Some(ollama) => Some(OllamaClient::new(&ollama.base_url, &ollama.model, ollama.timeout)?),
        None => None,
    };

    Ok(AppState {
        classifier,
        preprocess,
        store,
        llm,
        heatmap_enabled: config.heatmap_enabled,
        inference_timeout: config.inference_timeout,
    })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}
