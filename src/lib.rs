pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod helpers;
pub mod logging;
pub mod mapping;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod recommendations;
pub mod routes;
pub mod service;

pub use crate::cli::{Args, Command};
pub use crate::config::{ServiceConfig, resolve_cache_dir};
pub use crate::engine::{Detector, InferenceEngine, Prediction};
pub use crate::error::{DiagnosisError, StartupError};
pub use crate::mapping::load_class_mapping;
pub use crate::model::{DetectorConfig, Device, OnnxDetector, OnnxModel};
pub use crate::postprocess::{Detection, non_maximum_suppression};
pub use crate::preprocess::{PreprocessConfig, Processor};
pub use crate::recommendations::{RecommendationEntry, Recommendations};
pub use crate::routes::router;
pub use crate::service::{DiagnoseOptions, DiagnosisResult, DiagnosisService, SharedService};
