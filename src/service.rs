use std::io::Read;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use image::DynamicImage;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::engine::{InferenceEngine, Prediction, validate_threshold};
use crate::error::{DiagnosisError, Result, StartupError};
use crate::helpers::render_visualization;
use crate::recommendations::{RecommendationEntry, Recommendations};

/// Name reported to HTTP clients when nothing clears the threshold.
pub const NO_DETECTION_LABEL: &str = "No Detection";

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnoseOptions {
    /// Overrides the configured default threshold.
    pub conf_threshold: Option<f32>,
    pub visualize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisResult {
    pub disease_name: Option<String>,
    /// Percent, `[0, 100]`
    pub confidence: f32,
    pub is_healthy: bool,
    pub recommendations: Option<RecommendationEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<String>,
}

impl DiagnosisResult {
    pub fn no_detection() -> Self {
        Self {
            disease_name: None,
            confidence: 0.0,
            is_healthy: false,
            recommendations: None,
            visualization: None,
        }
    }

    pub fn is_detection(&self) -> bool {
        self.disease_name.is_some()
    }
}

/// A class is healthy iff its name contains "healthy", ignoring case.
pub fn is_healthy(disease_name: Option<&str>) -> bool {
    disease_name.is_some_and(|name| name.to_lowercase().contains("healthy"))
}

/// One image of a batch, in the caller's order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub index: usize,
    pub label: Option<String>,
    pub outcome: std::result::Result<DiagnosisResult, DiagnosisError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
    pub detected: usize,
    pub no_detection: usize,
    pub failed: usize,
}

impl BatchReport {
    fn from_items(items: Vec<BatchItem>) -> Self {
        let (mut detected, mut no_detection, mut failed) = (0, 0, 0);
        for item in &items {
            match &item.outcome {
                Ok(result) if result.is_detection() => detected += 1,
                Ok(_) => no_detection += 1,
                Err(_) => failed += 1,
            }
        }
        Self { items, detected, no_detection, failed }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub ready: bool,
    pub cache_dir: String,
    pub model_path: String,
    pub classes: usize,
    pub recommendations: usize,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

/// Wraps the inference engine behind request-level semantics.
///
/// Starts uninitialized; [`install_engine`](Self::install_engine) moves it to
/// ready exactly once. Before that every prediction fails with `NotReady`.
#[derive(Debug)]
pub struct DiagnosisService {
    engine: OnceLock<InferenceEngine>,
    recommendations: Arc<Recommendations>,
    config: ServiceConfig,
    started_at: DateTime<Utc>,
    started: Instant,
}

pub type SharedService = Arc<DiagnosisService>;

impl DiagnosisService {
    pub fn new(recommendations: Recommendations, config: ServiceConfig) -> Self {
        Self {
            engine: OnceLock::new(),
            recommendations: Arc::new(recommendations),
            config,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn install_engine(&self, engine: InferenceEngine) -> std::result::Result<(), StartupError> {
        let classes = engine.class_names().len();
        self.engine.set(engine).map_err(|_| StartupError::AlreadyInitialized)?;
        info!(classes, "diagnosis service ready");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.engine.get().is_some()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn engine(&self) -> Result<&InferenceEngine> {
        self.engine.get().ok_or(DiagnosisError::NotReady)
    }

    /// Decodes `bytes` and diagnoses the image.
    pub fn diagnose_bytes(&self, bytes: &[u8], options: DiagnoseOptions) -> Result<DiagnosisResult> {
        // Fail fast before decoding when no model is loaded.
        self.engine()?;
        let image = decode_image(bytes)?;
        self.diagnose_image(&image, options)
    }

    pub fn diagnose_image(&self, image: &DynamicImage, options: DiagnoseOptions) -> Result<DiagnosisResult> {
        let engine = self.engine()?;
        let conf = options.conf_threshold.unwrap_or(self.config.default_conf);
        validate_threshold(conf)?;

        let (disease_name, confidence, detection) = match engine.infer(image, conf)? {
            Prediction::NoDetection => {
                debug!(conf, "no detection");
                return Ok(DiagnosisResult::no_detection());
            }
            Prediction::Detected { disease_name, confidence, detection } => (disease_name, confidence, detection),
        };

        let recommendations = self.recommendations.lookup(&disease_name).cloned();
        let visualization = if options.visualize {
            match render_visualization(image, &detection) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    warn!(error = %e, "visualization failed, returning result without it");
                    None
                }
            }
        } else {
            None
        };

        debug!(disease = %disease_name, confidence, "diagnosed");
        Ok(DiagnosisResult {
            is_healthy: is_healthy(Some(&disease_name)),
            disease_name: Some(disease_name),
            confidence,
            recommendations,
            visualization,
        })
    }

    /// Diagnoses every image independently. Items come back in input order;
    /// a failing image does not affect the others.
    pub fn diagnose_batch(&self, images: Vec<(Option<String>, Vec<u8>)>, options: DiagnoseOptions) -> Result<BatchReport> {
        self.engine()?;
        let t = Instant::now();
        let items: Vec<BatchItem> = images
            .into_par_iter()
            .enumerate()
            .map(|(index, (label, bytes))| BatchItem {
                index,
                outcome: self.diagnose_bytes(&bytes, options),
                label,
            })
            .collect();
        let report = BatchReport::from_items(items);
        info!(
            images = report.items.len(),
            detected = report.detected,
            no_detection = report.no_detection,
            failed = report.failed,
            elapsed = ?t.elapsed(),
            "batch diagnosed"
        );
        Ok(report)
    }

    pub fn health(&self) -> HealthStatus {
        let engine = self.engine.get();
        HealthStatus {
            status: if engine.is_some() { "running" } else { "initializing" },
            ready: engine.is_some(),
            cache_dir: self.config.cache_dir.display().to_string(),
            model_path: self.config.model_path.display().to_string(),
            classes: engine.map(|e| e.class_names().len()).unwrap_or(0),
            recommendations: self.recommendations.len(),
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.started_at,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

/// Downloads an image over HTTP(S), refusing bodies larger than `limit` bytes.
/// `timeout` bounds the whole exchange, connect included.
pub fn fetch_image(url: &str, limit: usize, timeout: Duration) -> Result<Vec<u8>> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(DiagnosisError::InvalidRequest(format!("unsupported URL '{}'", url)));
    }
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout(timeout)
        .build();
    let response = agent.get(url).call().map_err(|e| DiagnosisError::Fetch(e.to_string()))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| DiagnosisError::Fetch(e.to_string()))?;
    if bytes.len() > limit {
        return Err(DiagnosisError::Fetch(format!("image at '{}' exceeds {} bytes", url, limit)));
    }
    debug!(url, bytes = bytes.len(), "fetched image");
    Ok(bytes)
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(DiagnosisError::Decode("empty image payload".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| DiagnosisError::Decode(e.to_string()))
}
