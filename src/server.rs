use crate::{
    api::{ErrorResponse, HealthResponse, ProcessImageRequest, ProcessImageResponse},
    pipeline::PipelineError,
    startup_coordinator::{InitResult, Lifecycle},
};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use crossbeam::channel::TrySendError;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MEGABYTE: usize = 1024 * 1024; // 1 MB = 1024 * 1024 bytes
const THIRTY_MEGABYTES: usize = 30 * MEGABYTE; // 30 MB in bytes

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a request waits for the pipeline worker.
    pub request_timeout: Duration,
}

pub struct ServerState {
    lifecycle: Mutex<Lifecycle>,
    request_timeout: Duration,
}

impl ServerState {
    pub fn new(server_config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Mutex::new(Lifecycle::default()),
            request_timeout: server_config.request_timeout,
        })
    }
}

pub async fn run_server(
    port: u16,
    cancellation_token: CancellationToken,
    init_receiver: oneshot::Receiver<InitResult>,
    server_config: ServerConfig,
) -> anyhow::Result<()> {
    let server_state = ServerState::new(server_config);
    server_state.lifecycle.lock().await.begin_loading()?;

    // Serve /health as degraded while the models load
    tokio::spawn(watch_initialization(server_state.clone(), init_receiver));

    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
    info!("Starting server, listening on {}", addr);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(
                "Looks like {port} is already in use by another application, please turn off the other application or pick another port with --port"
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    axum::serve(listener, router(server_state).into_make_service())
        .with_graceful_shutdown(async move { cancellation_token.cancelled().await })
        .await?;
    info!("Server stopped");
    Ok(())
}

pub fn router(server_state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/process_image/", post(process_image))
        .route("/process_image", post(process_image))
        .route("/health", get(health))
        .fallback(fallback_handler)
        .with_state(server_state)
        .layer(DefaultBodyLimit::max(THIRTY_MEGABYTES))
}

async fn watch_initialization(
    server_state: Arc<ServerState>,
    init_receiver: oneshot::Receiver<InitResult>,
) {
    let init_result = match init_receiver.await {
        Ok(init_result) => init_result,
        Err(_) => InitResult::Failed("Initialization channel dropped".to_string()),
    };

    match &init_result {
        InitResult::Success(handle) => info!(
            detector_model = %handle.model_info.detector_model,
            recognizer_model = %handle.model_info.recognizer_model,
            "Models ready - server can now process images"
        ),
        InitResult::Failed(reason) => error!(%reason, "Model initialization failed"),
    }

    if let Err(err) = server_state.lifecycle.lock().await.complete(init_result) {
        error!(?err, "Failed to record model initialization result");
    }
}

async fn process_image(
    State(server_state): State<Arc<ServerState>>,
    multipart: Result<Multipart, MultipartRejection>, // Note multipart needs to be last
) -> Result<Json<ProcessImageResponse>, ApiError> {
    let request_start_time = Instant::now();

    let sender = {
        let lifecycle = server_state.lifecycle.lock().await;
        match lifecycle.handle() {
            Some(handle) => handle.sender.clone(),
            None => {
                debug!("Rejecting request, models are {}", *lifecycle);
                return Err(ApiError::NotReady);
            }
        }
    };

    let mut multipart = multipart?;
    let mut request = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let image_name = field.file_name().map(str::to_string);
            let image_data = field.bytes().await?;
            request = Some(ProcessImageRequest {
                image_data,
                image_name,
            });
        }
    }
    let request = request.ok_or(ApiError::MissingFile)?;
    debug!(
        image_name = ?request.image_name,
        size = request.image_data.len(),
        "Received image"
    );

    let (reply_sender, reply_receiver) = oneshot::channel();
    match sender.try_send((request, reply_sender, request_start_time)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("Worker queue is full server is overloaded, rejecting request");
            return Err(ApiError::QueueFull);
        }
        Err(TrySendError::Disconnected(_)) => {
            error!("Pipeline worker is gone, cannot process request");
            return Err(ApiError::Internal("pipeline worker stopped".to_string()));
        }
    }

    let result = match timeout(server_state.request_timeout, reply_receiver).await {
        Ok(Ok(result)) => result?,
        Ok(Err(err)) => {
            warn!(?err, "Pipeline worker dropped the request");
            return Err(ApiError::Internal(
                "pipeline worker dropped the request".to_string(),
            ));
        }
        Err(_) => {
            warn!(
                "Timeout after {:?} while waiting for the pipeline",
                server_state.request_timeout
            );
            return Err(ApiError::Timeout);
        }
    };

    let response = ProcessImageResponse::from(result);
    info!(
        status = ?response.status,
        plate_text = ?response.plate_text,
        confidence = response.confidence,
        "Processed image in {:?}",
        request_start_time.elapsed()
    );
    Ok(Json(response))
}

async fn health(State(server_state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let models_loaded = server_state.lifecycle.lock().await.models_loaded();
    Json(HealthResponse::new(models_loaded))
}

async fn fallback_handler(req: Request<Body>) -> impl IntoResponse {
    debug!(
        "Unimplemented endpoint called: Method: {}, URI: {}, Headers: {:?}",
        req.method(),
        req.uri(),
        req.headers()
    );

    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            detail: "Not Found".to_string(),
        }),
    )
}

/// Every error a handler can return, rendered as `{"detail": ..}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("File gambar tidak valid.")]
    InvalidImage,
    #[error("Field 'file' wajib diisi.")]
    MissingFile,
    #[error("{detail}")]
    BadRequest { status: StatusCode, detail: String },
    #[error("Model belum siap, coba lagi nanti.")]
    NotReady,
    #[error("Server sedang sibuk, coba lagi nanti.")]
    QueueFull,
    #[error("Waktu pemrosesan habis, coba lagi nanti.")]
    Timeout,
    #[error("Terjadi kesalahan internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidImage => StatusCode::BAD_REQUEST,
            ApiError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest { status, .. } => *status,
            ApiError::NotReady | ApiError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Decode(err) => {
                debug!(%err, "Rejecting undecodable image");
                ApiError::InvalidImage
            }
            PipelineError::Internal(err) => ApiError::Internal(format!("{err:#}")),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::BadRequest {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest {
            status: err.status(),
            detail: err.body_text(),
        }
    }
}
