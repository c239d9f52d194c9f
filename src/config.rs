use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::Level;

use crate::models::{DetectionMode, TaskKind};
use crate::normalize::NormalizeOptions;
use crate::provider::ProviderSettings;

/// Image classification / detection inference service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "MODEL_API_LOG")]
    pub log_level: Level,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server (default)
    Serve(ServeArgs),
    /// Download a model file
    Download(DownloadArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1", env = "MODEL_API_HOST")]
    pub host: String,

    #[arg(long, default_value_t = 8080, env = "MODEL_API_PORT")]
    pub port: u16,

    /// ONNX model file
    #[arg(long, value_name = "FILE", default_value = "best.onnx", env = "MODEL_API_MODEL")]
    pub model: PathBuf,

    /// Class names: JSON object, JSON array or one name per line
    #[arg(long, value_name = "FILE", env = "MODEL_API_LABELS")]
    pub labels: Option<PathBuf>,

    /// Model task; inferred from the model output when omitted
    #[arg(long, value_enum, env = "MODEL_API_TASK")]
    pub task: Option<TaskKind>,

    /// How detections are reported
    #[arg(long, value_enum, default_value_t = DetectionMode::BestPerClass, env = "MODEL_API_MODE")]
    pub mode: DetectionMode,

    /// Model input size in pixels
    #[arg(long, default_value_t = 640)]
    pub imgsz: u32,

    /// Detection confidence threshold (0.0 - 1.0)
    #[arg(long, default_value_t = 0.25, value_name = "THRESHOLD")]
    pub conf: f32,

    /// NMS IoU threshold (0.0 - 1.0)
    #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
    pub iou: f32,

    /// Report only the K most probable classes
    #[arg(long, value_name = "K")]
    pub top_k: Option<usize>,

    /// Upper bound on a single inference call
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    #[arg(long, default_value_t = 10 * 1024 * 1024, value_name = "BYTES")]
    pub max_upload_bytes: usize,

    /// Directory for per-request upload scratch space; system temp dir when omitted
    #[arg(long, value_name = "DIR", env = "MODEL_API_UPLOAD_DIR")]
    pub upload_dir: Option<PathBuf>,

    /// Answer input errors with 400 and provider errors with 5xx instead of 200
    #[arg(long, env = "MODEL_API_STRICT_STATUS")]
    pub strict_status: bool,
}

impl Default for ServeArgs {
    fn default() -> Self {
        // Same values as the command-line defaults.
        Self::parse_from_defaults()
    }
}

impl ServeArgs {
    fn parse_from_defaults() -> Self {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: ServeArgs,
        }
        Wrapper::parse_from(["model-api"]).args
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            model: self.model.clone(),
            labels: self.labels.clone(),
            task: self.task,
            imgsz: self.imgsz,
            conf_threshold: self.conf,
            iou_threshold: self.iou,
            top_k: self.top_k,
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            mode: self.mode,
            task: self.task,
            timeout: Duration::from_secs(self.timeout_secs),
            max_upload_bytes: self.max_upload_bytes,
            upload_dir: self.upload_dir.clone(),
            strict_status: self.strict_status,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    #[arg(long, env = "MODEL_API_MODEL_URL")]
    pub url: String,

    #[arg(long, value_name = "FILE", default_value = "best.onnx")]
    pub output: PathBuf,

    /// Load the downloaded model to check it is usable
    #[arg(long)]
    pub verify: bool,

    #[arg(long, default_value_t = 640)]
    pub imgsz: u32,
}

/// Request-handling settings shared by all workers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: DetectionMode,
    pub task: Option<TaskKind>,
    pub timeout: Duration,
    pub max_upload_bytes: usize,
    pub upload_dir: Option<PathBuf>,
    pub strict_status: bool,
}

impl Settings {
    /// Options for a model that may or may not declare its own task. A task
    /// given in the configuration takes precedence.
    pub fn normalize_options(&self, model_task: Option<TaskKind>) -> NormalizeOptions {
        NormalizeOptions {
            task: self.task.or(model_task),
            mode: self.mode,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        ServeArgs::default().settings()
    }
}
