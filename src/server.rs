use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use candle::Device;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::classes::ClassTable;
use crate::error::{AdvisoryError, ApiError, StartupError};
use crate::gemini::{self, AdvisoryBackend, AdvisoryOutcome, TEST_PROMPT};
use crate::model::{Classifier, Prediction, MODEL_NAME};
use crate::preprocess::{decode_image, preprocess_image, IMG_SIZE};
use crate::utils::Settings;
use crate::vit::ViTConfig;

/// Read-only context shared by every request once startup has finished.
pub struct AppState {
    pub classifier: Classifier,
    /// `None` when no candidate model passed verification.
    pub advisor: Option<AdvisoryBackend>,
}

impl AppState {
    pub fn new(classifier: Classifier, advisor: Option<AdvisoryBackend>) -> Self {
        Self {
            classifier,
            advisor,
        }
    }

    /// Class table, then model, then advisory backend. Only the last may fail softly.
    pub async fn initialize(settings: &Settings) -> Result<Self, StartupError> {
        Self::initialize_with(settings, ViTConfig::deit_base_patch16_224).await
    }

    /// Same as [`AppState::initialize`] with the network shape derived from the
    /// class count by `config`.
    pub async fn initialize_with(
        settings: &Settings,
        config: impl Fn(usize) -> ViTConfig,
    ) -> Result<Self, StartupError> {
        let classes = ClassTable::load(&settings.class_names_path)?;

        let device = Device::cuda_if_available(0)
            .map_err(|e| StartupError::ModelLoad(e.to_string()))?;
        let config = config(classes.len());
        let classifier =
            Classifier::load_with_config(&settings.model_path, classes, &config, device)?;
        info!("Class mapping: {} classes", classifier.classes().len());

        let advisor = gemini::configure(
            settings.gemini_api_key.as_deref(),
            &settings.gemini_base_url,
        )
        .await;

        Ok(Self::new(classifier, advisor))
    }
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub filename: Option<String>,
    pub predictions: Vec<Prediction>,
    pub model: &'static str,
    pub input_size: u32,
    pub gemini_severity: String,
    pub gemini_treatment: String,
    pub gemini_prevention: String,
}

struct Upload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

pub fn create_router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/predict", post(predict_handler))
        .route("/test-gemini", get(test_gemini_handler))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let filename = field.file_name().map(str::to_string);
            let bytes = field.bytes().await?.to_vec();
            return Ok(Upload { filename, bytes });
        }
    }
    Err(ApiError::MissingFile)
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let Upload { filename, bytes } = read_upload(&mut multipart).await?;
    if bytes.is_empty() {
        return Err(ApiError::EmptyFile);
    }

    let worker = Arc::clone(&state);
    let predictions = tokio::task::spawn_blocking(move || -> Result<Vec<Prediction>, ApiError> {
        let image = decode_image(&bytes)?;
        preprocess_image(&image)
            .and_then(|tensor| worker.classifier.predict(&tensor))
            .map_err(|e| {
                error!("Prediction failed: {}", e);
                ApiError::from(e)
            })
    })
    .await
    .map_err(|e| {
        error!("Inference task failed: {}", e);
        ApiError::Internal
    })??;

    let top_prediction = predictions
        .first()
        .map(|p| p.class.as_str())
        .unwrap_or("Unknown disease");

    let outcome = match &state.advisor {
        Some(backend) => backend.advise(top_prediction).await,
        None => {
            warn!("Gemini model not configured, skipping API call");
            AdvisoryOutcome::Fallback {
                reason: AdvisoryError::NotConfigured,
            }
        }
    };
    let advisory = outcome.into_advisory();

    Ok(Json(PredictResponse {
        filename,
        predictions,
        model: MODEL_NAME,
        input_size: IMG_SIZE,
        gemini_severity: advisory.severity,
        gemini_treatment: advisory.treatment,
        gemini_prevention: advisory.prevention,
    }))
}

fn diagnostic_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

/// Sends a fixed prompt to the bound backend and echoes the reply.
async fn test_gemini_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(backend) = &state.advisor else {
        return diagnostic_error("Gemini not configured");
    };

    match backend.generate(TEST_PROMPT).await {
        Ok(text) => Json(json!({
            "status": "success",
            "model": "Gemini",
            "backend": backend.model(),
            "prompt": TEST_PROMPT,
            "response": text,
        }))
        .into_response(),
        Err(AdvisoryError::EmptyResponse) => diagnostic_error("Empty response from Gemini"),
        Err(e) => diagnostic_error(&e.to_string()),
    }
}

fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "classes": state.classifier.classes().len(),
        "device": device_name(state.classifier.device()),
        "advisory_backend": state.advisor.as_ref().map(AdvisoryBackend::model),
    }))
}

pub async fn run_server(settings: &Settings, state: AppState) -> Result<(), std::io::Error> {
    let app = create_router(Arc::new(state), settings.body_limit_bytes);
    let addr = format!("0.0.0.0:{}", settings.port);

    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::DType;
    use candle_nn::{VarBuilder, VarMap};
    use std::fs;
    use std::path::Path;

    use crate::vit::VisionTransformer;

    fn tiny_config(num_classes: usize) -> ViTConfig {
        ViTConfig {
            image_size: 32,
            patch_size: 16,
            embed_dim: 8,
            depth: 1,
            num_heads: 2,
            mlp_ratio: 2,
            layer_norm_eps: 1e-6,
            num_classes,
        }
    }

    fn settings(dir: &Path) -> Settings {
        let mut settings = Settings::from_lookup(|_: &str| None).unwrap();
        settings.class_names_path = dir.join("class_names.json");
        settings.model_path = dir.join("vit.safetensors");
        settings.gemini_api_key = None;
        settings
    }

    fn write_classes(settings: &Settings) {
        fs::write(
            &settings.class_names_path,
            r#"["Apple___Apple_scab", "Apple___healthy", "Tomato___Late_blight", "Tomato___healthy"]"#,
        )
        .unwrap();
    }

    fn write_checkpoint(settings: &Settings) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        VisionTransformer::new(&tiny_config(4), vb).unwrap();
        varmap.save(&settings.model_path).unwrap();
    }

    #[tokio::test]
    async fn missing_class_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        write_checkpoint(&settings);

        let result = AppState::initialize_with(&settings, tiny_config).await;
        assert!(matches!(result, Err(StartupError::Configuration(_))));
    }

    #[tokio::test]
    async fn malformed_class_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        fs::write(&settings.class_names_path, r#"{"0": "a", "2": "b"}"#).unwrap();
        write_checkpoint(&settings);

        let result = AppState::initialize_with(&settings, tiny_config).await;
        assert!(matches!(result, Err(StartupError::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        write_classes(&settings);

        let result = AppState::initialize_with(&settings, tiny_config).await;
        assert!(matches!(result, Err(StartupError::ModelLoad(_))));
    }

    #[tokio::test]
    async fn starts_without_advisory_backend() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        write_classes(&settings);
        write_checkpoint(&settings);

        let state = AppState::initialize_with(&settings, tiny_config).await.unwrap();
        assert!(state.advisor.is_none());
        assert_eq!(state.classifier.classes().len(), 4);
    }
}
