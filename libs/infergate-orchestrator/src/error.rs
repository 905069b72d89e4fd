use std::time::Duration;

/// Errors surfaced by the orchestrator. `Clone` so a single load outcome can
/// be handed to every caller waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to start backend for '{key}': {reason}")]
    SpawnFailed { key: String, reason: String },

    #[error("backend for '{key}' was not ready within {timeout:?}")]
    LoadTimeout { key: String, timeout: Duration },

    #[error("all {max} backend slots are busy and none is idle enough to evict")]
    CapacityExceeded { max: usize },

    #[error("no backend loaded for '{0}'")]
    BackendNotFound(String),

    #[error("process {pid} cannot be sampled: {reason}")]
    ProcessUnavailable { pid: u32, reason: String },

    #[error("RPC to backend '{key}' failed: {message}")]
    RpcFailure { key: String, message: String },

    #[error("backend registry is shutting down")]
    ShuttingDown,

    #[error("invalid backend key {0:?}")]
    InvalidKey(String),

    #[error("model catalog: {0}")]
    Catalog(String),
}

impl OrchestratorError {
    pub(crate) fn spawn_failed(key: impl ToString, reason: impl ToString) -> Self {
        Self::SpawnFailed {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
