use crate::{
    pipeline::{ModelInfo, Pipeline},
    worker::{JobSender, PipelineWorker, job_channel},
};
use anyhow::bail;
use std::fmt;
use tokio::sync::oneshot;
use tracing::{error, info};

/// What the server needs to talk to a running pipeline worker.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    pub sender: JobSender,
    pub model_info: ModelInfo,
}

/// Result of model initialization
pub enum InitResult {
    Success(PipelineHandle),
    Failed(String),
}

/// Readiness of the service.
///
/// `Uninitialized -> Loading -> Ready | Failed`. `Ready` is terminal.
#[derive(Debug, Default)]
pub enum Lifecycle {
    #[default]
    Uninitialized,
    Loading,
    Ready(PipelineHandle),
    Failed(String),
}

impl Lifecycle {
    pub fn begin_loading(&mut self) -> anyhow::Result<()> {
        match self {
            Lifecycle::Uninitialized => {
                *self = Lifecycle::Loading;
                Ok(())
            }
            other => bail!("Cannot start loading models while {other}"),
        }
    }

    pub fn complete(&mut self, init_result: InitResult) -> anyhow::Result<()> {
        if !matches!(self, Lifecycle::Loading) {
            bail!("Cannot complete model loading while {self}");
        }
        *self = match init_result {
            InitResult::Success(handle) => Lifecycle::Ready(handle),
            InitResult::Failed(reason) => Lifecycle::Failed(reason),
        };
        Ok(())
    }

    pub fn models_loaded(&self) -> bool {
        matches!(self, Lifecycle::Ready(_))
    }

    pub fn handle(&self) -> Option<&PipelineHandle> {
        match self {
            Lifecycle::Ready(handle) => Some(handle),
            _ => None,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Uninitialized => write!(f, "uninitialized"),
            Lifecycle::Loading => write!(f, "loading"),
            Lifecycle::Ready(_) => write!(f, "ready"),
            Lifecycle::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Runs `loader` on a background thread and returns a receiver for the result.
///
/// On success the same thread goes on to run the pipeline worker, so the
/// models never leave the thread that loaded them.
pub fn spawn_model_initialization<F>(
    loader: F,
    worker_queue_size: Option<usize>,
) -> oneshot::Receiver<InitResult>
where
    F: FnOnce() -> anyhow::Result<Pipeline> + Send + 'static,
{
    let (init_sender, init_receiver) = oneshot::channel();

    std::thread::spawn(move || {
        info!("Startup worker thread: Beginning model initialization...");
        let pipeline = match loader() {
            Ok(pipeline) => pipeline,
            Err(err) => {
                error!(error = ?err, "Startup worker thread: Model initialization failed");
                if init_sender.send(InitResult::Failed(format!("{err:#}"))).is_err() {
                    error!("Startup worker thread: Failed to send failure result to server");
                }
                return;
            }
        };

        let model_info = pipeline.model_info();
        info!(
            detector_model = %model_info.detector_model,
            recognizer_model = %model_info.recognizer_model,
            "Startup worker thread: Models loaded, starting pipeline worker"
        );

        let (sender, receiver) = job_channel(worker_queue_size);
        let handle = PipelineHandle { sender, model_info };
        if init_sender.send(InitResult::Success(handle)).is_err() {
            error!("Startup worker thread: Failed to send initialization result to server");
            return;
        }

        PipelineWorker::new(pipeline, receiver).run();
    });

    init_receiver
}
