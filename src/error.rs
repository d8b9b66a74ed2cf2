use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Fatal conditions raised while the service is starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("model load error: {0}")]
    ModelLoad(String),
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<ClassifierError> for StartupError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::ModelLoad(msg) => StartupError::ModelLoad(msg),
            ClassifierError::Inference(msg) => StartupError::ModelLoad(msg),
        }
    }
}

/// Why advisory text could not be produced.
#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory backend is not configured")]
    NotConfigured,
    #[error("GEMINI_API_KEY not found in environment")]
    MissingApiKey,
    #[error("request to advisory backend failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("advisory backend returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("empty response from advisory backend")]
    EmptyResponse,
    #[error("response is missing the `{0}` section")]
    MissingSection(&'static str),
    #[error("all {tried} candidate models failed to initialize")]
    NoModelAvailable { tried: usize },
}

impl AdvisoryError {
    /// Parse failures mean the backend answered but ignored the template.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, AdvisoryError::MissingSection(_))
    }
}

/// Per-request failures surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Empty file uploaded")]
    EmptyFile,
    #[error("No file uploaded")]
    MissingFile,
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] axum::extract::multipart::MultipartError),
    #[error("Invalid image format: {0}")]
    InvalidImage(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::EmptyFile | ApiError::MissingFile => StatusCode::BAD_REQUEST,
            ApiError::Multipart(err) => err.status(),
            ApiError::InvalidImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ClassifierError> for ApiError {
    fn from(_: ClassifierError) -> Self {
        ApiError::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(ApiError::EmptyFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::InvalidImage("bad header".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn inference_failure_hides_detail() {
        let err: ApiError = ClassifierError::Inference("shape mismatch [1, 3]".into()).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Internal server error");
    }

    #[test]
    fn only_missing_sections_count_as_parse_failures() {
        assert!(AdvisoryError::MissingSection("Severity:").is_parse_failure());
        assert!(!AdvisoryError::EmptyResponse.is_parse_failure());
        assert!(!AdvisoryError::Api { status: 403, body: String::new() }.is_parse_failure());
    }
}
