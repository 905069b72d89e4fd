use backend_grpc_stubs::{BackendState, StatusResponse};
use parking_lot::RwLock;

/// Model load state reported through `Status`.
#[derive(Debug)]
pub struct LoadState {
    inner: RwLock<Snapshot>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: BackendState,
    message: String,
}

impl Default for LoadState {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                state: BackendState::Uninitialized,
                message: String::new(),
            }),
        }
    }
}

impl LoadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> BackendState {
        self.inner.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.current() == BackendState::Ready
    }

    pub fn status(&self) -> StatusResponse {
        let snapshot = self.inner.read().clone();
        StatusResponse {
            state: snapshot.state as i32,
            message: snapshot.message,
        }
    }

    /// Move to `Loading`. A load arriving in any state other than
    /// `Uninitialized` is unexpected but still honoured.
    pub fn begin_load(&self, model: &str) {
        let mut inner = self.inner.write();
        if inner.state != BackendState::Uninitialized {
            tracing::warn!(
                model,
                state = ?inner.state,
                "load requested while a model is already loading or loaded"
            );
        }
        inner.state = BackendState::Loading;
        inner.message = format!("loading {model}");
    }

    pub fn finish_load(&self, outcome: Result<(), String>) {
        let mut inner = self.inner.write();
        match outcome {
            Ok(()) => {
                inner.state = BackendState::Ready;
                inner.message.clear();
            }
            Err(message) => {
                inner.state = BackendState::Error;
                inner.message = message;
            }
        }
    }
}
