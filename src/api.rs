use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use image::DynamicImage;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::diagnosis;
use crate::error::AppError;
use crate::heatmap;
use crate::inference::{CropClassifier, InferenceResult};
use crate::llm::{self, OllamaClient};
use crate::preprocess::PreprocessConfig;
use crate::storage::{Detection, DetectionStore, DetectionView};

pub struct AppState {
    pub classifier: CropClassifier,
    pub preprocess: PreprocessConfig,
    pub store: DetectionStore,
    pub llm: Option<OllamaClient>,
    pub heatmap_enabled: bool,
    pub inference_timeout: Duration,
}

pub fn router(state: Arc<AppState>, body_limit_bytes: usize, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/predict", post(predict_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/history", get(history_handler))
        .route("/api/detections/{detection_id}", get(detection_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

struct Upload {
    bytes: Bytes,
    content_type: Option<String>,
    crop_name: Option<String>,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    let mut file = None;
    let mut crop_name = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Multipart(e.to_string()))?
    {
        match field.name() {
            Some("file") => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Multipart(e.to_string()))?;
                file = Some((bytes, content_type));
            }
            Some("crop_name") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Multipart(e.to_string()))?;
                let text = text.trim();
                if !text.is_empty() {
                    crop_name = Some(text.to_string());
                }
            }
            _ => {}
        }
    }

    match file {
        Some((bytes, content_type)) if !bytes.is_empty() => Ok(Upload {
            bytes,
            content_type,
            crop_name,
        }),
        _ => Err(AppError::MissingFile),
    }
}

/// Decode, preprocess and predict on the blocking pool, bounded by the
/// configured timeout.
async fn classify(
    state: &Arc<AppState>,
    bytes: Bytes,
    crop_name: Option<String>,
) -> Result<(InferenceResult, DynamicImage), AppError> {
    let worker_state = state.clone();
    let task = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
        let image = worker_state.preprocess.decode(&bytes)?;
        let tensor = worker_state.preprocess.to_tensor(&image);
        let result = worker_state
            .classifier
            .predict(tensor, crop_name.as_deref())?;
        Ok((result, image))
    });

    match tokio::time::timeout(state.inference_timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AppError::Internal(join_err.to_string())),
        Err(_) => Err(AppError::Timeout(state.inference_timeout)),
    }
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let upload = read_upload(multipart).await?;
    let (result, _) = classify(&state, upload.bytes, upload.crop_name).await?;
    Ok(Json(json!({ "prediction": result })))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    id: String,
    prediction: String,
    confidence: f64,
    image_url: String,
    heatmap_url: Option<String>,
    diagnosis: String,
    crop_name: Option<String>,
    degraded: bool,
}

fn image_extension(content_type: Option<&str>) -> (&'static str, &'static str) {
    match content_type {
        Some(ct) if ct.contains("png") => ("png", "image/png"),
        _ => ("jpg", "image/jpeg"),
    }
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let upload = read_upload(multipart).await?;
    let upload_id = Uuid::new_v4().to_string();
    let crop_name = upload.crop_name.clone();

    let (result, image) = classify(&state, upload.bytes.clone(), upload.crop_name).await?;
    info!(
        "Upload {}: {} ({:.3}) crop={}",
        upload_id, result.label, result.confidence, result.crop_name
    );

    let heatmap = if state.heatmap_enabled {
        match tokio::task::spawn_blocking(move || heatmap::render(&image)).await {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(e)) => {
                warn!("Heatmap generation failed: {}", e);
                None
            }
            Err(e) => {
                warn!("Heatmap task failed: {}", e);
                None
            }
        }
    } else {
        None
    };

    let (extension, content_type) = image_extension(upload.content_type.as_deref());
    let image_url = state
        .store
        .upload_object(
            &format!("images/{upload_id}.{extension}"),
            upload.bytes.to_vec(),
            content_type,
        )
        .await?;

    let heatmap_url = match heatmap {
        Some(bytes) => match state
            .store
            .upload_object(&format!("heatmaps/{upload_id}.jpg"), bytes, "image/jpeg")
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Heatmap upload failed for {}: {}", upload_id, e);
                None
            }
        },
        None => None,
    };

    let mut diagnosis = diagnosis::summary(&result.label, result.confidence, crop_name.as_deref());
    if let Some(client) = &state.llm {
        let insights = client
            .diagnose(&image_url, &result.label, result.confidence, crop_name.as_deref())
            .await;
        if !llm::is_fallback(&insights) {
            diagnosis = format!("{diagnosis}\n\n**AI-Generated Additional Insights:**\n{insights}");
        }
    }

    let detection = Detection {
        id: upload_id,
        image_url,
        heatmap_url,
        pest_name: result.label,
        confidence: result.confidence,
        crop_name,
        diagnosis: Some(diagnosis),
        created_at: Utc::now(),
    };
    state.store.insert(&detection).await?;

    Ok(Json(UploadResponse {
        id: detection.id,
        prediction: detection.pest_name,
        confidence: detection.confidence,
        image_url: detection.image_url,
        heatmap_url: detection.heatmap_url,
        diagnosis: detection.diagnosis.unwrap_or_default(),
        crop_name: detection.crop_name,
        degraded: result.degraded,
    }))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DetectionView>>, AppError> {
    let rows = state.store.history().await?;
    Ok(Json(rows.into_iter().map(DetectionView::from).collect()))
}

async fn detection_handler(
    State(state): State<Arc<AppState>>,
    Path(detection_id): Path<String>,
) -> Result<Json<DetectionView>, AppError> {
    state
        .store
        .get(&detection_id)
        .await?
        .map(|d| Json(DetectionView::from(d)))
        .ok_or(AppError::NotFound)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "message": "Crop Disease Detection API is running" }))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now().to_rfc3339() }))
}

async fn ready_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let classifier = &state.classifier;
    Json(json!({
        "status": "ready",
        "model_inputs": format!("{:?}", classifier.signature()),
        "crop_conditioned": classifier.signature().takes_crop_id(),
        "layout": classifier.layout(),
        "classes": classifier.classes().len(),
        "crops": classifier.crops().len(),
        "storage": state.store.backend_name(),
        "llm": state.llm.is_some(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::MissingCropPolicy;
    use crate::labels::{ClassLabelTable, CropLabelTable, CropToGlobalClasses};
    use crate::model::testing::fake;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-CROP-BOUNDARY";

    fn app(heatmap_enabled: bool) -> Router {
        app_with_store(heatmap_enabled, MemoryStore::default())
    }

    fn app_with_store(heatmap_enabled: bool, store: MemoryStore) -> Router {
        let (runtime, _) = fake(&["image"], vec![0.1, 0.2, 5.0, 1.0, 2.0]);
        let mut blocks = BTreeMap::new();
        blocks.insert("0".to_string(), vec![0, 1, 2]);
        blocks.insert("1".to_string(), vec![3, 4]);
        let classifier = CropClassifier::new(
            runtime,
            ClassLabelTable::new(vec![
                "healthy_rice".into(),
                "rice_leaf_smut".into(),
                "rice_brown_spot".into(),
                "healthy_tomato".into(),
                "tomato_early_blight".into(),
            ]),
            CropLabelTable::new(vec!["rice".into(), "tomato".into()]),
            Some(CropToGlobalClasses::new(blocks)),
            MissingCropPolicy::default(),
        )
        .unwrap();

        let state = AppState {
            classifier,
            preprocess: PreprocessConfig {
                img_size: 8,
                ..Default::default()
            },
            store: DetectionStore::Memory(store),
            llm: None,
            heatmap_enabled,
            inference_timeout: Duration::from_secs(5),
        };
        router(Arc::new(state), 1024 * 1024, CorsLayer::permissive())
    }

    fn png() -> Vec<u8> {
        let img = ImageBuffer::from_pixel(12, 12, Rgb([30u8, 140, 60]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn multipart(file: Option<&[u8]>, crop_name: Option<&str>) -> Body {
        let mut body = Vec::new();
        if let Some(bytes) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"leaf.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(crop) = crop_name {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"crop_name\"\r\n\r\n{crop}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn post(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(body)
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn predict_returns_crop_slice_result() {
        let response = app(false)
            .oneshot(post("/predict", multipart(Some(&png()), Some("Tomato"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let prediction = &body["prediction"];
        assert_eq!(prediction["label"], "tomato_early_blight");
        assert_eq!(prediction["global_class_idx"], 4);
        assert_eq!(prediction["local_class_idx"], 1);
        assert_eq!(prediction["crop_name"], "tomato");
    }

    #[tokio::test]
    async fn upload_persists_and_is_listed() {
        let app = app(true);

        let response = app
            .clone()
            .oneshot(post("/api/upload", multipart(Some(&png()), Some("rice"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let upload = json_body(response).await;
        let id = upload["id"].as_str().unwrap().to_string();
        assert_eq!(upload["prediction"], "rice_brown_spot");
        assert_eq!(upload["image_url"], format!("memory://images/{id}.png"));
        assert_eq!(upload["heatmap_url"], format!("memory://heatmaps/{id}.jpg"));
        assert!(upload["diagnosis"]
            .as_str()
            .unwrap()
            .starts_with("**Diagnosis: Rice Brown Spot**"));
        let confidence = upload["confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&confidence));

        let history = json_body(app.clone().oneshot(get("/api/history")).await.unwrap()).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["id"], id.as_str());
        assert_eq!(history[0]["crop_name"], "rice");

        let response = app
            .oneshot(get(&format!("/api/detections/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["prediction"], "rice_brown_spot");
    }

    #[tokio::test]
    async fn failed_heatmap_upload_still_stores_detection() {
        let app = app_with_store(true, MemoryStore::rejecting("heatmaps/"));

        let response = app
            .clone()
            .oneshot(post("/api/upload", multipart(Some(&png()), Some("rice"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let upload = json_body(response).await;
        let id = upload["id"].as_str().unwrap().to_string();
        assert!(upload["heatmap_url"].is_null());
        assert_eq!(upload["image_url"], format!("memory://images/{id}.png"));

        let response = app
            .oneshot(get(&format!("/api/detections/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["heatmap_url"].is_null());
    }

    #[tokio::test]
    async fn missing_file_is_bad_request() {
        let response = app(false)
            .oneshot(post("/api/upload", multipart(None, Some("rice"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file uploaded");
    }

    #[tokio::test]
    async fn undecodable_image_is_bad_request() {
        let response = app(false)
            .oneshot(post("/predict", multipart(Some(b"definitely not a png"), None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_detection_is_not_found() {
        let response = app(false)
            .oneshot(get("/api/detections/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_ready() {
        let app = app(false);
        let health = json_body(app.clone().oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(health["status"], "healthy");

        let ready = json_body(app.oneshot(get("/ready")).await.unwrap()).await;
        assert_eq!(ready["layout"], "concatenated");
        assert_eq!(ready["classes"], 5);
        assert_eq!(ready["storage"], "memory");
    }
}
