use crate::{LogLevel, model_store::ModelSource};
use clap::Parser;
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = "HTTP service that finds a license plate in an image and reads its text"
)]
pub struct Cli {
    /// The port on which the server will listen for HTTP requests.
    #[arg(long, env = "PORT", default_value_t = 8888)]
    pub port: u16,
    /// Plate detector ONNX model, a local path or hf://<owner>/<repo>/<file>
    #[arg(long, env = "PLATE_SCAN_DETECTOR_MODEL", default_value = "plate_detector.onnx")]
    pub detector_model: ModelSource,
    /// Text recognizer ONNX model, a local path or hf://<owner>/<repo>/<file>
    #[arg(long, env = "PLATE_SCAN_RECOGNIZER_MODEL", default_value = "plate_recognizer.onnx")]
    pub recognizer_model: ModelSource,
    /// Character dictionary of the recognizer, one character per line.
    /// Default: the recognizer model with a .txt extension
    #[arg(long)]
    pub recognizer_dictionary: Option<ModelSource>,
    /// Minimum detector score for a plate candidate
    #[arg(long, default_value_t = 0.25)]
    pub confidence_threshold: f32,
    /// Overlap above which the less confident of two candidates is dropped
    #[arg(long, default_value_t = 0.7)]
    pub iou_threshold: f32,
    /// Convert the plate crop to grayscale before recognition
    #[arg(long, default_value_t = false)]
    pub grayscale_crop: bool,
    /// Intra thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub intra_threads: usize,
    /// Inter thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub inter_threads: usize,
    /// Number of requests that may wait for the pipeline before new ones
    /// are rejected. Unbounded if not set.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub worker_queue_size: Option<u32>,
    /// Seconds to wait for the pipeline before a request times out
    #[arg(long = "request-timeout", default_value = "30", value_parser = parse_seconds)]
    pub request_timeout: Duration,
    /// Optional path to save the processed images
    #[arg(long)]
    pub save_image_path: Option<PathBuf>,
    /// Save the reference image (only if save_image_path is provided)
    #[arg(long, default_value_t = false)]
    pub save_ref_image: bool,
    /// Sets the level of logging, RUST_LOG takes precedence
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// If log_path is set, then stdout logging will be disabled and it will log to file
    #[arg(long)]
    pub log_path: Option<PathBuf>,
}

impl Cli {
    pub fn recognizer_dictionary(&self) -> ModelSource {
        self.recognizer_dictionary
            .clone()
            .unwrap_or_else(|| self.recognizer_model.with_extension("txt"))
    }
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: u64 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a whole number of seconds"))?;
    if seconds == 0 {
        return Err("timeout must be at least one second".to_string());
    }
    Ok(Duration::from_secs(seconds))
}
