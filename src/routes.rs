//! HTTP surface of the diagnosis service.

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Query, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{DiagnosisError, ErrorBody, Result};
use crate::recommendations::RecommendationEntry;
use crate::service::{
    BatchItem, DiagnoseOptions, DiagnosisResult, HealthStatus, NO_DETECTION_LABEL, SharedService, fetch_image,
};

/// Query string accepted by the prediction routes.
#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    pub conf: Option<f32>,
    pub visualize: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub url: String,
    pub conf: Option<f32>,
    #[serde(default)]
    pub visualize: bool,
}

/// Response body of `/predict`. Confidence is a fraction in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub disease_name: String,
    pub confidence: f32,
    pub is_healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<RecommendationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization: Option<String>,
}

impl From<DiagnosisResult> for PredictResponse {
    fn from(result: DiagnosisResult) -> Self {
        Self {
            disease_name: result.disease_name.unwrap_or_else(|| NO_DETECTION_LABEL.to_string()),
            confidence: result.confidence / 100.0,
            is_healthy: result.is_healthy,
            recommendations: result.recommendations,
            visualization: result.visualization,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchItemResponse {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PredictResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl From<BatchItem> for BatchItemResponse {
    fn from(item: BatchItem) -> Self {
        let (status, result, error) = match item.outcome {
            Ok(result) => ("ok", Some(PredictResponse::from(result)), None),
            Err(e) => ("error", None, Some(ErrorBody::from(&e))),
        };
        Self { index: item.index, filename: item.label, status, result, error }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResponse>,
    pub total: usize,
    pub detected: usize,
    pub no_detection: usize,
    pub failed: usize,
}

pub fn router(service: SharedService) -> Router {
    let body_limit = service.config().max_upload_bytes;
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .route("/predict/url", post(predict_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// GET / and GET /health
pub async fn health_check(State(service): State<SharedService>) -> Json<HealthStatus> {
    Json(service.health())
}

/// POST /predict - multipart with an `image` file field
pub async fn predict(
    State(service): State<SharedService>,
    query: std::result::Result<Query<PredictQuery>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>> {
    ensure_ready(&service)?;
    let Query(query) = query.map_err(|e| rejection(e.status(), e.body_text()))?;
    let mut multipart = multipart.map_err(|e| rejection(e.status(), e.body_text()))?;

    let mut image = None;
    let mut conf = query.conf;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => image = Some(field.bytes().await.map_err(multipart_error)?.to_vec()),
            Some("conf") => conf = Some(parse_conf(&field.text().await.map_err(multipart_error)?)?),
            _ => {}
        }
    }
    let bytes = image.ok_or_else(|| DiagnosisError::InvalidRequest("No image provided".to_string()))?;

    let options = DiagnoseOptions {
        conf_threshold: conf,
        visualize: query.visualize.unwrap_or(false),
    };
    let result = run_blocking(move || service.diagnose_bytes(&bytes, options)).await?;
    Ok(Json(PredictResponse::from(result)))
}

/// POST /predict/batch - every file field is one image, kept in upload order
pub async fn predict_batch(
    State(service): State<SharedService>,
    query: std::result::Result<Query<PredictQuery>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchResponse>> {
    ensure_ready(&service)?;
    let Query(query) = query.map_err(|e| rejection(e.status(), e.body_text()))?;
    let mut multipart = multipart.map_err(|e| rejection(e.status(), e.body_text()))?;

    let mut images = Vec::new();
    let mut conf = query.conf;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("conf") {
            conf = Some(parse_conf(&field.text().await.map_err(multipart_error)?)?);
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?.to_vec();
        images.push((filename, bytes));
    }
    if images.is_empty() {
        return Err(DiagnosisError::InvalidRequest("No images provided".to_string()));
    }

    let options = DiagnoseOptions {
        conf_threshold: conf,
        visualize: query.visualize.unwrap_or(false),
    };
    let report = run_blocking(move || service.diagnose_batch(images, options)).await?;
    Ok(Json(BatchResponse {
        total: report.items.len(),
        detected: report.detected,
        no_detection: report.no_detection,
        failed: report.failed,
        results: report.items.into_iter().map(BatchItemResponse::from).collect(),
    }))
}

/// POST /predict/url - JSON `{"url": ..., "conf": ..., "visualize": ...}`
pub async fn predict_url(
    State(service): State<SharedService>,
    request: std::result::Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>> {
    ensure_ready(&service)?;
    let Json(request) = request.map_err(|e| rejection(e.status(), e.body_text()))?;

    let limit = service.config().max_upload_bytes;
    let timeout = service.config().fetch_timeout;
    let options = DiagnoseOptions {
        conf_threshold: request.conf,
        visualize: request.visualize,
    };
    let result = run_blocking(move || {
        let bytes = fetch_image(&request.url, limit, timeout)?;
        service.diagnose_bytes(&bytes, options)
    })
    .await?;
    Ok(Json(PredictResponse::from(result)))
}

fn ensure_ready(service: &SharedService) -> Result<()> {
    if service.is_ready() { Ok(()) } else { Err(DiagnosisError::NotReady) }
}

fn parse_conf(raw: &str) -> Result<f32> {
    raw.trim()
        .parse()
        .map_err(|_| DiagnosisError::InvalidRequest(format!("conf must be a number, got '{}'", raw)))
}

/// Maps an extractor rejection onto the JSON error shape, keeping 413 distinct.
fn rejection(status: StatusCode, message: String) -> DiagnosisError {
    match status {
        StatusCode::PAYLOAD_TOO_LARGE => DiagnosisError::TooLarge(message),
        _ => DiagnosisError::InvalidRequest(message),
    }
}

fn multipart_error(e: MultipartError) -> DiagnosisError {
    match e.status() {
        StatusCode::PAYLOAD_TOO_LARGE => DiagnosisError::TooLarge(e.body_text()),
        _ => DiagnosisError::InvalidRequest(format!("malformed multipart body: {}", e.body_text())),
    }
}

/// Runs inference off the async workers. A panic inside becomes a
/// request-level failure.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        warn!(error = %e, "inference task failed");
        DiagnosisError::Inference(format!("worker task failed: {}", e))
    })?
}
