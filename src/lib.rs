use anyhow::{Context, anyhow};
use clap::ValueEnum;
use cli::Cli;
use detector::{DetectorConfig, OnnxConfig, OnnxPlateDetector};
use model_store::resolve_models;
use pipeline::{Pipeline, PipelineConfig};
use recognizer::{OnnxTextRecognizer, RecognizerConfig};
use server::{ServerConfig, run_server};
use startup_coordinator::spawn_model_initialization;
use std::{future::Future, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};

pub mod api;
pub mod cli;
pub mod detector;
pub mod image;
pub mod model_store;
pub mod pipeline;
pub mod recognizer;
pub mod selector;
pub mod server;
pub mod startup_coordinator;
pub mod worker;

/// Builds the service from the command line.
///
/// Models load on a background thread; the returned future serves HTTP
/// right away and reports not ready until loading finishes. Cancel the
/// token to shut down.
pub fn plate_scan_service(
    args: Cli,
) -> anyhow::Result<(impl Future<Output = anyhow::Result<()>>, CancellationToken)> {
    let dictionary = args.recognizer_dictionary();
    let onnx_config = OnnxConfig {
        intra_threads: args.intra_threads,
        inter_threads: args.inter_threads,
    };
    let pipeline_config = PipelineConfig {
        grayscale_crop: args.grayscale_crop,
        save_image_path: args.save_image_path.clone(),
        save_ref_image: args.save_ref_image,
    };
    let detector_model = args.detector_model.clone();
    let recognizer_model = args.recognizer_model.clone();
    let confidence_threshold = args.confidence_threshold;
    let iou_threshold = args.iou_threshold;

    let loader = move || -> anyhow::Result<Pipeline> {
        let paths = resolve_models(&[&detector_model, &recognizer_model, &dictionary])?;
        let [detector_path, recognizer_path, dictionary_path]: [PathBuf; 3] = paths
            .try_into()
            .map_err(|_| anyhow!("Expected three resolved model paths"))?;

        if let Some(save_image_path) = pipeline_config.save_image_path.as_ref() {
            std::fs::create_dir_all(save_image_path).with_context(|| {
                format!("Failed to create {}", save_image_path.display())
            })?;
        }

        let detector = OnnxPlateDetector::new(DetectorConfig {
            model: detector_path,
            confidence_threshold,
            iou_threshold,
            onnx_config: onnx_config.clone(),
        })
        .context("Failed to initialize plate detector")?;
        let recognizer = OnnxTextRecognizer::new(RecognizerConfig {
            model: recognizer_path,
            dictionary: dictionary_path,
            onnx_config,
        })
        .context("Failed to initialize text recognizer")?;

        Ok(Pipeline::new(
            Box::new(detector),
            Box::new(recognizer),
            pipeline_config,
        ))
    };

    let init_receiver =
        spawn_model_initialization(loader, args.worker_queue_size.map(|size| size as usize));

    let cancel_token = CancellationToken::new();
    let server_future = run_server(
        args.port,
        cancel_token.clone(),
        init_receiver,
        ServerConfig {
            request_timeout: args.request_timeout,
        },
    );

    Ok((server_future, cancel_token))
}

pub fn init_logging(
    log_level: LogLevel,
    log_path: Option<PathBuf>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    let guard = if let Some(log_directory) = log_path {
        let log_file = log_directory.join("plate_scan.log");
        println!("Starting plate-scan, logging into: {}", log_file.display());

        let file_appender = tracing_appender::rolling::daily(&log_directory, "plate_scan.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
            .try_init()
            .map_err(|_| anyhow!("Logging already initialized"))?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|_| anyhow!("Logging already initialized"))?;

        None
    };

    info!(?log_level, "Logging initialized");
    Ok(guard)
}

fn level_to_filter_string(log_level: LogLevel) -> &'static str {
    match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}
