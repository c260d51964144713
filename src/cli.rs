use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::engine::DEFAULT_CONF_THRESHOLD;
use crate::model::Device;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Plant leaf disease diagnosis over ONNX Runtime", long_about = None)]
pub struct Args {
    /// ONNX model path
    #[arg(long, global = true, env = "PLANT_MODEL_PATH", default_value = "best_model.onnx")]
    pub model: PathBuf,

    /// Class list (JSON array or one name per line); defaults to the names embedded in the model
    #[arg(long, global = true, env = "PLANT_CLASS_NAMES")]
    pub class_names: Option<PathBuf>,

    /// Treatment recommendations JSON
    #[arg(long, global = true, env = "PLANT_RECOMMENDATIONS")]
    pub recommendations: Option<PathBuf>,

    #[arg(long, global = true, env = "PLANT_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = Device::Cpu)]
    pub device: Device,

    /// Square model input size
    #[arg(long, global = true, default_value_t = 512)]
    pub imgsz: usize,

    /// Default confidence threshold
    #[arg(long, global = true, default_value_t = DEFAULT_CONF_THRESHOLD)]
    pub conf: f32,

    /// IoU threshold for non-maximum suppression
    #[arg(long, global = true, default_value_t = 0.7)]
    pub iou: f32,

    /// Seconds allowed for downloading an image from a URL
    #[arg(long, global = true, default_value_t = 30)]
    pub fetch_timeout: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve predictions over HTTP
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(short, long, env = "PORT", default_value_t = 7860)]
        port: u16,

        #[arg(long, default_value_t = 10 * 1024 * 1024)]
        max_upload_bytes: usize,
    },

    /// Diagnose local images or http(s) URLs and print the results
    Predict {
        #[arg(required = true)]
        images: Vec<String>,

        /// Write box overlays for detections here
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
