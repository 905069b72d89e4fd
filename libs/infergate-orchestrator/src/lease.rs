//! Counted borrow of a backend handle.

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::client::{
    BackendStatus, ClientError, ClientResult, PredictRequest, Prediction, TokenStream,
    Tokenization,
};
use crate::error::{OrchestratorError, Result};
use crate::handle::BackendHandle;
use crate::options::BackendKey;
use crate::registry::RegistryInner;

/// Keeps a backend from being evicted while held. Calls made through a
/// lease that fail at the transport level take the backend out of service.
pub struct BackendLease {
    handle: Arc<BackendHandle>,
    registry: Arc<RegistryInner>,
}

impl BackendLease {
    pub(crate) fn new(handle: Arc<BackendHandle>, registry: Arc<RegistryInner>) -> Self {
        handle.acquire();
        Self { handle, registry }
    }

    pub fn handle(&self) -> &Arc<BackendHandle> {
        &self.handle
    }

    pub fn key(&self) -> &BackendKey {
        self.handle.key()
    }

    pub async fn status(&self) -> Result<BackendStatus> {
        self.ensure_usable()?;
        let result = self.handle.client().status().await;
        self.settle(result)
    }

    pub async fn predict(&self, request: &PredictRequest) -> Result<Prediction> {
        self.ensure_usable()?;
        let result = self.handle.client().predict(request).await;
        self.settle(result)
    }

    /// Stream a prediction. The stream keeps its own lease, so the backend
    /// stays pinned until the stream is dropped.
    pub async fn predict_stream(&self, request: &PredictRequest) -> Result<LeasedStream> {
        self.ensure_usable()?;
        let result = self.handle.client().predict_stream(request).await;
        let inner = self.settle(result)?;
        Ok(LeasedStream {
            inner,
            lease: self.clone(),
        })
    }

    pub async fn tokenize(&self, request: &PredictRequest) -> Result<Tokenization> {
        self.ensure_usable()?;
        let result = self.handle.client().tokenize_string(request).await;
        self.settle(result)
    }

    fn ensure_usable(&self) -> Result<()> {
        let state = self.handle.state();
        if state.is_terminal() {
            return Err(self.rpc_failure(format!("backend is {state:?}")));
        }
        Ok(())
    }

    fn settle<T>(&self, result: ClientResult<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.handle.touch();
                Ok(value)
            }
            Err(e) => Err(self.on_error(e)),
        }
    }

    fn on_error(&self, e: ClientError) -> OrchestratorError {
        if e.is_transport() || self.handle.process_exited() {
            self.registry.mark_failed(&self.handle);
        } else {
            tracing::debug!(key = %self.key(), error = %e, "backend rejected request");
        }
        self.rpc_failure(e.to_string())
    }

    fn rpc_failure(&self, message: String) -> OrchestratorError {
        OrchestratorError::RpcFailure {
            key: self.key().to_string(),
            message,
        }
    }
}

impl Clone for BackendLease {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.handle), Arc::clone(&self.registry))
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Prediction stream bound to a lease. Dropping it cancels the backend call.
pub struct LeasedStream {
    inner: TokenStream,
    lease: BackendLease,
}

impl Stream for LeasedStream {
    type Item = Result<Prediction>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(this.lease.on_error(e)))),
            Poll::Ready(None) => {
                this.lease.handle.touch();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for LeasedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedStream")
            .field("key", self.lease.key())
            .finish_non_exhaustive()
    }
}
