//! Starting backends: the [`BackendSpawner`] seam and its local-process
//! implementation.

use async_trait::async_trait;
use std::sync::Arc;

use crate::client::{BackendClient, Endpoint};
use crate::error::Result;
use crate::options::{BackendKey, LoadOptions};

pub mod launch;
pub mod local;
pub mod process;

pub use local::LocalProcessSpawner;
pub use process::BackendProcess;

/// A backend that answered the readiness protocol and holds the model.
pub struct SpawnedBackend {
    pub kind: String,
    pub endpoint: Endpoint,
    pub client: Arc<dyn BackendClient>,
    /// `None` when attached to an externally managed backend.
    pub process: Option<BackendProcess>,
}

impl std::fmt::Debug for SpawnedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedBackend")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("process", &self.process)
            .finish()
    }
}

/// Produces ready backends for the registry. Dropping the returned future
/// must release everything it started.
#[async_trait]
pub trait BackendSpawner: Send + Sync {
    async fn spawn(&self, key: &BackendKey, options: &LoadOptions) -> Result<SpawnedBackend>;
}
