//! Orchestrator side of the backend RPC contract.
//!
//! The registry only talks to backends through [`BackendClient`]; the gRPC
//! implementation converts between the generated proto messages and the
//! domain types defined here.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tonic::transport::Channel;

use backend_grpc_stubs::{
    BackendClient as BackendRpcClient, BackendState as ProtoState, HealthMessage,
    ModelOptions as ProtoModelOptions, PredictOptions, Reply,
};

use crate::config::GrpcSettings;

/// Where a backend can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub uri: String,
}

/// Typed view of an endpoint for parsing and matching
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Tcp(std::net::SocketAddr),
    Other(String),
}

impl Endpoint {
    /// Accepts a full URI or a bare `host:port`, which is taken as plain HTTP/2.
    pub fn from_uri<S: Into<String>>(s: S) -> Self {
        let uri = s.into();
        if uri.contains("://") {
            Self { uri }
        } else {
            Self {
                uri: format!("http://{uri}"),
            }
        }
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            uri: format!("http://{host}:{port}"),
        }
    }

    pub fn kind(&self) -> EndpointKind {
        if let Some(rest) = self.uri.strip_prefix("http://") {
            if let Ok(addr) = rest.trim_end_matches('/').parse::<std::net::SocketAddr>() {
                return EndpointKind::Tcp(addr);
            }
        }
        EndpointKind::Other(self.uri.clone())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Failure of a single backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The backend could not be reached; the handle is no longer trustworthy.
    #[error("backend unreachable: {0}")]
    Unavailable(String),
    /// The backend answered but refused or failed the request.
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Unavailable(_))
    }
}

/// Messages hyper and h2 attach when a connection breaks under a call.
const CONNECTION_FAILURE_MARKERS: &[&str] = &[
    "h2 protocol error",
    "error reading a body from connection",
    "transport error",
    "connection reset",
    "connection closed",
    "broken pipe",
];

/// A status the channel produced because the connection itself failed, as
/// opposed to one the backend returned.
fn is_connection_failure(status: &tonic::Status) -> bool {
    use tonic::Code;

    match status.code() {
        Code::Unavailable => return true,
        Code::Unknown | Code::Internal | Code::Cancelled => {}
        _ => return false,
    }
    let mut source = std::error::Error::source(status);
    while let Some(err) = source {
        if err.is::<std::io::Error>() || err.is::<tonic::transport::Error>() {
            return true;
        }
        source = err.source();
    }
    let message = status.message().to_ascii_lowercase();
    CONNECTION_FAILURE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        if status.code() == tonic::Code::Unavailable {
            ClientError::Unavailable(status.message().to_string())
        } else if is_connection_failure(&status) {
            ClientError::Unavailable(format!("{:?}: {}", status.code(), status.message()))
        } else {
            ClientError::Rejected(format!("{:?}: {}", status.code(), status.message()))
        }
    }
}

impl From<tonic::transport::Error> for ClientError {
    fn from(e: tonic::transport::Error) -> Self {
        ClientError::Unavailable(e.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Readiness reported by the backend itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Uninitialized,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub state: RemoteState,
    pub message: String,
}

/// Model load request sent once a fresh backend reports `Uninitialized`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOptions {
    pub model: String,
    pub model_file: String,
    pub model_path: String,
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub f16_memory: bool,
    pub quantization: Option<String>,
    pub mmap: bool,
    pub seed: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictRequest {
    pub prompt: String,
    pub tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub seed: i32,
    pub stop_prompts: Vec<String>,
}

impl Default for PredictRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            tokens: 128,
            temperature: 0.9,
            top_p: 0.95,
            top_k: 40,
            seed: -1,
            stop_prompts: Vec::new(),
        }
    }
}

impl PredictRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// One reply, or one chunk of a streamed reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prediction {
    pub message: Vec<u8>,
    pub tokens: u32,
    pub prompt_tokens: u32,
}

impl Prediction {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokenization {
    pub tokens: Vec<i32>,
}

impl Tokenization {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Streamed predictions. Dropping it cancels the underlying call so the
/// backend stops producing.
pub struct TokenStream {
    inner: Pin<Box<dyn Stream<Item = ClientResult<Prediction>> + Send>>,
}

impl TokenStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = ClientResult<Prediction>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for TokenStream {
    type Item = ClientResult<Prediction>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream").finish_non_exhaustive()
    }
}

/// Operations the orchestrator needs from a backend process.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn status(&self) -> ClientResult<BackendStatus>;

    async fn load(&self, options: &ModelOptions) -> ClientResult<()>;

    async fn predict(&self, request: &PredictRequest) -> ClientResult<Prediction>;

    async fn predict_stream(&self, request: &PredictRequest) -> ClientResult<TokenStream>;

    async fn tokenize_string(&self, request: &PredictRequest) -> ClientResult<Tokenization>;
}

/// Connection settings for [`GrpcBackendClient`].
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    pub service_name: String,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
    pub enable_tracing: bool,
}

impl GrpcClientConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
            enable_tracing: true,
        }
    }

    pub fn with_settings(mut self, settings: &GrpcSettings) -> Self {
        self.connect_timeout = settings.connect_timeout;
        self.rpc_timeout = settings.rpc_timeout;
        self
    }
}

/// gRPC implementation of [`BackendClient`].
#[derive(Clone)]
pub struct GrpcBackendClient {
    inner: BackendRpcClient<Channel>,
}

impl GrpcBackendClient {
    /// Connect eagerly; fails if nothing listens at `endpoint`.
    pub async fn connect_with_config(
        endpoint: &Endpoint,
        cfg: &GrpcClientConfig,
    ) -> ClientResult<Self> {
        let channel = Self::endpoint(endpoint, cfg)?.connect().await?;
        if cfg.enable_tracing {
            tracing::debug!(
                service_name = %cfg.service_name,
                endpoint = %endpoint,
                connect_timeout_ms = cfg.connect_timeout.as_millis(),
                rpc_timeout_ms = cfg.rpc_timeout.as_millis(),
                "backend gRPC client connected"
            );
        }
        Ok(Self::from_channel(channel))
    }

    /// Build a client whose channel connects on first use and reconnects
    /// afterwards; used while a freshly spawned backend is still binding.
    pub fn connect_lazy(endpoint: &Endpoint, cfg: &GrpcClientConfig) -> ClientResult<Self> {
        let channel = Self::endpoint(endpoint, cfg)?.connect_lazy();
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: BackendRpcClient::new(channel),
        }
    }

    fn endpoint(
        endpoint: &Endpoint,
        cfg: &GrpcClientConfig,
    ) -> ClientResult<tonic::transport::Endpoint> {
        Ok(tonic::transport::Endpoint::from_shared(endpoint.uri.clone())
            .map_err(|e| ClientError::Unavailable(format!("invalid endpoint {endpoint}: {e}")))?
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.rpc_timeout))
    }
}

#[async_trait]
impl BackendClient for GrpcBackendClient {
    async fn status(&self) -> ClientResult<BackendStatus> {
        let mut client = self.inner.clone();
        let response = client
            .status(tonic::Request::new(HealthMessage {}))
            .await?
            .into_inner();
        let state = match response.state() {
            ProtoState::Uninitialized => RemoteState::Uninitialized,
            ProtoState::Loading => RemoteState::Loading,
            ProtoState::Ready => RemoteState::Ready,
            ProtoState::Error => RemoteState::Error,
        };
        Ok(BackendStatus {
            state,
            message: response.message,
        })
    }

    async fn load(&self, options: &ModelOptions) -> ClientResult<()> {
        let mut client = self.inner.clone();
        let result = client
            .load_model(tonic::Request::new(to_proto_model_options(options)))
            .await?
            .into_inner();
        if result.success {
            Ok(())
        } else {
            Err(ClientError::Rejected(result.message))
        }
    }

    async fn predict(&self, request: &PredictRequest) -> ClientResult<Prediction> {
        let mut client = self.inner.clone();
        let reply = client
            .predict(tonic::Request::new(to_proto_predict(request)))
            .await?
            .into_inner();
        Ok(from_proto_reply(reply))
    }

    async fn predict_stream(&self, request: &PredictRequest) -> ClientResult<TokenStream> {
        let mut client = self.inner.clone();
        let streaming = client
            .predict_stream(tonic::Request::new(to_proto_predict(request)))
            .await?
            .into_inner();
        Ok(TokenStream::new(streaming.map(|item| {
            item.map(from_proto_reply).map_err(ClientError::from)
        })))
    }

    async fn tokenize_string(&self, request: &PredictRequest) -> ClientResult<Tokenization> {
        let mut client = self.inner.clone();
        let response = client
            .tokenize_string(tonic::Request::new(to_proto_predict(request)))
            .await?
            .into_inner();
        Ok(Tokenization {
            tokens: response.tokens,
        })
    }
}

fn to_proto_model_options(options: &ModelOptions) -> ProtoModelOptions {
    ProtoModelOptions {
        model: options.model.clone(),
        model_file: options.model_file.clone(),
        model_path: options.model_path.clone(),
        context_size: saturating_i32(options.context_size),
        threads: saturating_i32(options.threads),
        gpu_layers: saturating_i32(options.gpu_layers),
        f16_memory: options.f16_memory,
        quantization: options.quantization.clone().unwrap_or_default(),
        mmap: options.mmap,
        seed: options.seed,
    }
}

fn to_proto_predict(request: &PredictRequest) -> PredictOptions {
    PredictOptions {
        prompt: request.prompt.clone(),
        tokens: saturating_i32(request.tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: saturating_i32(request.top_k),
        seed: request.seed,
        stop_prompts: request.stop_prompts.clone(),
    }
}

fn from_proto_reply(reply: Reply) -> Prediction {
    Prediction {
        message: reply.message,
        tokens: u32::try_from(reply.tokens).unwrap_or(0),
        prompt_tokens: u32::try_from(reply.prompt_tokens).unwrap_or(0),
    }
}

fn saturating_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}
