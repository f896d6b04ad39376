use crate::{
    api::ProcessImageRequest,
    image::create_random_jpeg_name,
    pipeline::{Pipeline, PipelineError, PipelineResult},
};
use crossbeam::channel::{Receiver, Sender};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    time::Instant,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

pub type JobReply = Result<PipelineResult, PipelineError>;

/// A queued request, its reply channel and the time it was queued.
pub type Job = (ProcessImageRequest, oneshot::Sender<JobReply>, Instant);

pub type JobSender = Sender<Job>;

/// Bounded when `queue_size` is given, so a busy worker pushes back on callers.
pub fn job_channel(queue_size: Option<usize>) -> (Sender<Job>, Receiver<Job>) {
    match queue_size {
        Some(queue_size) => crossbeam::channel::bounded(queue_size),
        None => crossbeam::channel::unbounded(),
    }
}

/// Owns the pipeline and runs queued jobs one at a time.
pub struct PipelineWorker {
    receiver: Receiver<Job>,
    pipeline: Pipeline,
}

impl PipelineWorker {
    pub fn new(pipeline: Pipeline, receiver: Receiver<Job>) -> Self {
        Self { receiver, pipeline }
    }

    /// Runs until every sender is dropped.
    pub fn run(&mut self) {
        while let Ok((mut request, reply_sender, queued_at)) = self.receiver.recv() {
            debug!("Job waited {:?} in the queue", queued_at.elapsed());

            if request.image_name.is_none() {
                request.image_name = Some(create_random_jpeg_name());
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.pipeline.process_image(request)
            }))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(%message, "Pipeline panicked while processing an image");
                Err(PipelineError::Internal(anyhow::anyhow!(
                    "pipeline panicked: {message}"
                )))
            });

            if reply_sender.send(result).is_err() {
                debug!("Requester went away before the reply was ready");
            }
        }
        info!("Job channel closed, pipeline worker exiting");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
