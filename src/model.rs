use std::path::{Path, PathBuf};
use std::time::Instant;

use image::DynamicImage;
use ndarray::{Array, CowArray, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::ValueType;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::Detector;
use crate::error::{DiagnosisError, StartupError};
use crate::mapping::{ensure_class_count, load_class_mapping, parse_names_metadata};
use crate::postprocess::{Detection, decode_yolo_output, non_maximum_suppression};
use crate::preprocess::{PreprocessConfig, Processor};

/// ONNX Runtime execution provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Device {
    Cpu,
    Cuda,
    #[value(name = "tensorrt")]
    TensorRt,
}

pub struct OnnxModel {
    provider: Vec<ExecutionProviderDispatch>,
}

impl OnnxModel {
    /// TensorRT engines are cached under `cache_dir` so later starts skip the build.
    pub fn new(device: Device, cache_dir: &Path) -> Self {
        let provider = match device {
            Device::Cpu => vec![CPUExecutionProvider::default().build()],
            Device::Cuda => vec![CUDAExecutionProvider::default().build().error_on_failure()],
            Device::TensorRt => vec![
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(cache_dir.join("tensorrt").display().to_string())
                    .build()
                    .error_on_failure(),
                CUDAExecutionProvider::default().build(),
            ],
        };
        Self { provider }
    }

    pub fn load_model(&self, model_path: &Path) -> Result<Session, StartupError> {
        if !model_path.is_file() {
            return Err(StartupError::ModelNotFound(model_path.to_path_buf()));
        }
        let load_error = |e: ort::Error| StartupError::ModelLoad {
            path: model_path.to_path_buf(),
            reason: e.to_string(),
        };
        let session = SessionBuilder::new()
            .map_err(load_error)?
            .with_execution_providers(self.provider.clone())
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?
            .commit_from_file(model_path)
            .map_err(load_error)?;
        Ok(session)
    }
}

/// Largest accepted square input side.
pub const MAX_IMGSZ: usize = 4096;

/// Settings for building an [`OnnxDetector`].
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    /// Overrides the class names embedded in the model.
    pub class_names_path: Option<PathBuf>,
    pub device: Device,
    pub imgsz: usize,
    pub iou_threshold: f32,
}

impl DetectorConfig {
    /// Rejects input sizes and IoU thresholds the detector cannot run with.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.imgsz == 0 || self.imgsz > MAX_IMGSZ {
            return Err(StartupError::InvalidConfig(format!(
                "imgsz must be between 1 and {}, got {}",
                MAX_IMGSZ, self.imgsz
            )));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(StartupError::InvalidConfig(format!(
                "iou threshold must be between 0 and 1, got {}",
                self.iou_threshold
            )));
        }
        Ok(())
    }
}

/// YOLOv8 detector backed by an ONNX Runtime session.
pub struct OnnxDetector {
    session: Mutex<Session>,
    processor: Processor,
    class_names: Vec<String>,
    iou_threshold: f32,
}

impl std::fmt::Debug for OnnxDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxDetector")
            .field("session", &"ort::Session")
            .field("processor", &self.processor)
            .field("classes", &self.class_names.len())
            .finish()
    }
}

impl OnnxDetector {
    /// Loads the model and resolves its class list. Any inconsistency between
    /// the two is a startup failure.
    pub fn load(config: &DetectorConfig, cache_dir: &Path) -> Result<Self, StartupError> {
        config.validate()?;
        let t = Instant::now();
        let session = OnnxModel::new(config.device, cache_dir).load_model(&config.model_path)?;

        let class_names = match &config.class_names_path {
            Some(path) => load_class_mapping(path)?,
            None => embedded_class_names(&session, &config.model_path)?,
        };

        match model_class_count(&session) {
            Some(count) => ensure_class_count(&class_names, count)?,
            None => warn!("model output has a dynamic class dimension; class list length is not verified"),
        }

        info!(
            model = %config.model_path.display(),
            classes = class_names.len(),
            device = ?config.device,
            elapsed = ?t.elapsed(),
            "model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            processor: Processor::new(PreprocessConfig::square(config.imgsz)),
            class_names,
            iou_threshold: config.iou_threshold,
        })
    }
}

impl Detector for OnnxDetector {
    fn detect(&self, image: &DynamicImage, conf_threshold: f32) -> Result<Vec<Detection>, DiagnosisError> {
        let t = Instant::now();
        let (xs, letterboxes) = self
            .processor
            .preprocess(std::slice::from_ref(image))
            .map_err(|e| DiagnosisError::Inference(format!("preprocessing error: {}", e)))?;
        let xs = CowArray::from(xs);

        let outputs = {
            // Blocks the calling worker; never called from an async task directly.
            let session = self.session.blocking_lock();
            let input_data = ort::inputs![xs.view()]
                .map_err(|e| DiagnosisError::Inference(format!("ORT input error: {}", e)))?;
            let ys = session
                .run(input_data)
                .map_err(|e| DiagnosisError::Inference(format!("model run error: {}", e)))?;
            ys.iter()
                .map(|(_k, v)| v.try_extract_tensor::<f32>().map(|tensor| tensor.into_owned()))
                .collect::<Result<Vec<Array<f32, IxDyn>>, _>>()
                .map_err(|e| DiagnosisError::Inference(format!("output extraction error: {}", e)))?
        };
        debug!(elapsed = ?t.elapsed(), "model run");

        let output = outputs
            .first()
            .ok_or_else(|| DiagnosisError::Inference("model produced no outputs".to_string()))?;
        let candidates = decode_yolo_output(&output.view(), self.class_names.len(), conf_threshold, &letterboxes[0])?;
        Ok(non_maximum_suppression(candidates, self.iou_threshold))
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

fn embedded_class_names(session: &Session, model_path: &Path) -> Result<Vec<String>, StartupError> {
    let raw = session
        .metadata()
        .and_then(|meta| meta.custom("names"))
        .map_err(|e| StartupError::ModelLoad {
            path: model_path.to_path_buf(),
            reason: format!("cannot read model metadata: {}", e),
        })?
        .ok_or_else(|| {
            StartupError::ClassNames(format!(
                "'{}' has no embedded class names; pass a class list file",
                model_path.display()
            ))
        })?;
    parse_names_metadata(&raw)
}

/// Class count implied by the first output, `[1, 4 + nc, anchors]`.
fn model_class_count(session: &Session) -> Option<usize> {
    let output = session.outputs.first()?;
    let ValueType::Tensor { dimensions, .. } = &output.output_type else {
        return None;
    };
    class_count_from_dims(dimensions)
}

/// Picks the axis carrying `4 + nc` values. The anchor axis is always the
/// larger of the two for YOLOv8 heads.
pub(crate) fn class_count_from_dims(dims: &[i64]) -> Option<usize> {
    if dims.len() != 3 {
        return None;
    }
    let (a, b) = (dims[1], dims[2]);
    let fields = match (a > 0, b > 0) {
        (true, true) => a.min(b),
        (true, false) => a,
        (false, true) => b,
        (false, false) => return None,
    };
    (fields > 4).then(|| (fields - 4) as usize)
}
