//! Facade used by request handlers: model name in, backend call out.

use crate::catalog::ModelCatalog;
use crate::client::{PredictRequest, Prediction, Tokenization};
use crate::error::Result;
use crate::lease::{BackendLease, LeasedStream};
use crate::options::BackendKey;
use crate::registry::BackendRegistry;

#[derive(Clone)]
pub struct InferenceService {
    registry: BackendRegistry,
    catalog: ModelCatalog,
}

impl InferenceService {
    pub fn new(registry: BackendRegistry, catalog: ModelCatalog) -> Self {
        Self { registry, catalog }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Lease the backend serving `model`. Backends are keyed by model file,
    /// so configs sharing a file share a backend.
    pub async fn load(&self, model: &str) -> Result<BackendLease> {
        let options = self.catalog.load_options_for(model)?;
        let key = BackendKey::new(options.model_file.to_string_lossy())?;
        self.registry.load(&key, options).await
    }

    pub async fn predict(&self, model: &str, request: &PredictRequest) -> Result<Prediction> {
        let lease = self.load(model).await?;
        lease.predict(request).await
    }

    pub async fn predict_stream(&self, model: &str, request: &PredictRequest) -> Result<LeasedStream> {
        let lease = self.load(model).await?;
        lease.predict_stream(request).await
    }

    pub async fn tokenize(&self, model: &str, text: &str) -> Result<Tokenization> {
        let lease = self.load(model).await?;
        lease.tokenize(&PredictRequest::new(text)).await
    }
}
