//! Error types for the diagnosis service.
//!
//! `DiagnosisError` covers request-level failures: each one fails a single
//! request and leaves the process serving. `StartupError` covers everything
//! that stops the service from reaching the ready state.

use std::path::PathBuf;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Request-level failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiagnosisError {
    /// A prediction arrived before the model finished loading
    #[error("Model is not loaded yet")]
    NotReady,

    /// The uploaded bytes are not a decodable image
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// The request itself is malformed (missing image, bad threshold, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request body is over the configured upload limit
    #[error("Payload too large: {0}")]
    TooLarge(String),

    /// Downloading a remote image failed
    #[error("Failed to fetch image: {0}")]
    Fetch(String),

    /// The model run or its output decoding failed
    #[error("Inference failed: {0}")]
    Inference(String),
}

impl DiagnosisError {
    /// Stable, machine-readable kind reported in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            DiagnosisError::NotReady => "not_ready",
            DiagnosisError::Decode(_) => "decode_error",
            DiagnosisError::InvalidRequest(_) => "invalid_request",
            DiagnosisError::TooLarge(_) => "payload_too_large",
            DiagnosisError::Fetch(_) => "fetch_error",
            DiagnosisError::Inference(_) => "inference_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DiagnosisError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            DiagnosisError::Decode(_) | DiagnosisError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DiagnosisError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            DiagnosisError::Fetch(_) => StatusCode::BAD_GATEWAY,
            DiagnosisError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body returned for every failed request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

impl From<&DiagnosisError> for ErrorBody {
    fn from(err: &DiagnosisError) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl IntoResponse for DiagnosisError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorBody::from(&self))).into_response()
    }
}

/// Failure that prevents the service from becoming ready.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Model artifact not found at '{0}'")]
    ModelNotFound(PathBuf),

    #[error("Failed to load model '{path}': {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid class names: {0}")]
    ClassNames(String),

    #[error("Class list mismatch: model predicts {model} classes but {names} class names were supplied")]
    ClassCountMismatch { model: usize, names: usize },

    #[error("Diagnosis service is already initialized")]
    AlreadyInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiagnosisError>;
