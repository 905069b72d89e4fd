use async_trait::async_trait;
use backend_grpc_stubs::{
    Backend, HealthMessage, LoadResult, ModelOptions, PredictOptions, Reply, StatusResponse,
    TokenizationResponse,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::state::LoadState;

/// Replies buffered between a generating backend and a slow client.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no model loaded")]
    NotLoaded,
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("client went away")]
    Disconnected,
    #[error("{0}")]
    Failed(String),
}

impl From<BackendError> for Status {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotLoaded => Status::failed_precondition(e.to_string()),
            BackendError::Unsupported(_) => Status::unimplemented(e.to_string()),
            BackendError::InvalidRequest(_) => Status::invalid_argument(e.to_string()),
            BackendError::Disconnected => Status::cancelled(e.to_string()),
            BackendError::Failed(_) => Status::internal(e.to_string()),
        }
    }
}

/// Sends partial replies of a streamed prediction.
#[derive(Debug, Clone)]
pub struct TokenSender {
    tx: mpsc::Sender<Result<Reply, Status>>,
}

impl TokenSender {
    /// Fails with [`BackendError::Disconnected`] once the client is gone;
    /// generation should stop then.
    pub async fn send(&self, reply: Reply) -> Result<(), BackendError> {
        self.tx
            .send(Ok(reply))
            .await
            .map_err(|_| BackendError::Disconnected)
    }

    pub async fn send_text(&self, text: impl Into<Vec<u8>>) -> Result<(), BackendError> {
        self.send(Reply {
            message: text.into(),
            ..Default::default()
        })
        .await
    }
}

/// The inference a worker process provides.
#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    async fn load(&self, options: ModelOptions) -> Result<(), BackendError>;

    async fn predict(&self, options: PredictOptions) -> Result<Reply, BackendError>;

    /// Streams the prediction as one reply unless overridden.
    async fn predict_stream(
        &self,
        options: PredictOptions,
        tokens: TokenSender,
    ) -> Result<(), BackendError> {
        let reply = self.predict(options).await?;
        tokens.send(reply).await
    }

    async fn tokenize_string(&self, _options: PredictOptions) -> Result<Vec<i32>, BackendError> {
        Err(BackendError::Unsupported("tokenization"))
    }
}

/// Serves an [`InferenceBackend`] as the `Backend` gRPC service.
pub struct BackendService<B> {
    backend: Arc<B>,
    state: Arc<LoadState>,
    call_lock: Option<Arc<Mutex<()>>>,
}

impl<B> Clone for BackendService<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            state: Arc::clone(&self.state),
            call_lock: self.call_lock.clone(),
        }
    }
}

impl<B: InferenceBackend> BackendService<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            state: Arc::new(LoadState::new()),
            call_lock: None,
        }
    }

    /// Run load, predict and tokenize calls one at a time, for backends
    /// whose engine is not reentrant.
    pub fn serialize_calls(mut self) -> Self {
        self.call_lock = Some(Arc::new(Mutex::new(())));
        self
    }

    pub fn state(&self) -> &Arc<LoadState> {
        &self.state
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Load a model outside of any RPC and record the outcome in the
    /// reported status.
    pub async fn load(&self, options: ModelOptions) -> Result<(), BackendError> {
        self.state.begin_load(&options.model);
        self.load_started(options).await
    }

    async fn load_started(&self, options: ModelOptions) -> Result<(), BackendError> {
        let model = options.model.clone();
        let _guard = self.exclusive().await;
        let result = self.backend.load(options).await;
        match &result {
            Ok(()) => tracing::info!(%model, "model loaded"),
            Err(e) => tracing::error!(%model, error = %e, "model load failed"),
        }
        self.state
            .finish_load(result.as_ref().map(|_| ()).map_err(ToString::to_string));
        result
    }

    /// Mark the model as loading now and finish the load on a background
    /// task, so `Status` never reports `Uninitialized` in between.
    pub fn load_in_background(&self, options: ModelOptions) -> tokio::task::JoinHandle<()> {
        self.state.begin_load(&options.model);
        let service = self.clone();
        tokio::spawn(async move {
            let _ = service.load_started(options).await;
        })
    }

    async fn exclusive(&self) -> Option<OwnedMutexGuard<()>> {
        match &self.call_lock {
            Some(lock) => Some(Arc::clone(lock).lock_owned().await),
            None => None,
        }
    }

    fn ensure_ready(&self) -> Result<(), Status> {
        if self.state.is_ready() {
            Ok(())
        } else {
            Err(BackendError::NotLoaded.into())
        }
    }
}

#[tonic::async_trait]
impl<B: InferenceBackend> Backend for BackendService<B> {
    async fn health(&self, _request: Request<HealthMessage>) -> Result<Response<Reply>, Status> {
        Ok(Response::new(Reply {
            message: b"OK".to_vec(),
            ..Default::default()
        }))
    }

    async fn status(
        &self,
        _request: Request<HealthMessage>,
    ) -> Result<Response<StatusResponse>, Status> {
        Ok(Response::new(self.state.status()))
    }

    async fn load_model(
        &self,
        request: Request<ModelOptions>,
    ) -> Result<Response<LoadResult>, Status> {
        let options = request.into_inner();
        let reply = match self.load(options).await {
            Ok(()) => LoadResult {
                success: true,
                message: "model loaded".to_string(),
            },
            Err(e) => LoadResult {
                success: false,
                message: e.to_string(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn predict(&self, request: Request<PredictOptions>) -> Result<Response<Reply>, Status> {
        self.ensure_ready()?;
        let _guard = self.exclusive().await;
        let reply = self.backend.predict(request.into_inner()).await?;
        Ok(Response::new(reply))
    }

    type PredictStreamStream = ReceiverStream<Result<Reply, Status>>;

    async fn predict_stream(
        &self,
        request: Request<PredictOptions>,
    ) -> Result<Response<Self::PredictStreamStream>, Status> {
        self.ensure_ready()?;
        let options = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let service = self.clone();

        tokio::spawn(async move {
            let _guard = service.exclusive().await;
            let tokens = TokenSender { tx: tx.clone() };
            tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("stream consumer went away; generation stopped");
                }
                result = service.backend.predict_stream(options, tokens) => match result {
                    Ok(()) | Err(BackendError::Disconnected) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "streamed prediction failed");
                        let _ = tx.send(Err(e.into())).await;
                    }
                },
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn tokenize_string(
        &self,
        request: Request<PredictOptions>,
    ) -> Result<Response<TokenizationResponse>, Status> {
        self.ensure_ready()?;
        let _guard = self.exclusive().await;
        let tokens = self.backend.tokenize_string(request.into_inner()).await?;
        Ok(Response::new(TokenizationResponse {
            length: i32::try_from(tokens.len()).unwrap_or(i32::MAX),
            tokens,
        }))
    }
}
