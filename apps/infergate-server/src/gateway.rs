//! Builds the orchestrator from application config.

use anyhow::{Context, Result};
use infergate_bootstrap::paths::resolve_under_home;
use infergate_bootstrap::{module_config_typed, ConfigProvider};
use infergate_orchestrator::{
    BackendConfig, BackendConfigLookup, BackendMonitor, BackendRegistry, InferenceService,
    LocalProcessSpawner, ModelCatalog, ModelDefaults, ModelDir, OrchestratorConfig,
    RegistrySettings, StaticBackendConfigs, SysinfoSampler,
};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const ORCHESTRATOR_MODULE: &str = "orchestrator";
pub const MODELS_MODULE: &str = "models";

pub struct Gateway {
    config: Arc<OrchestratorConfig>,
    registry: BackendRegistry,
    inference: InferenceService,
    monitor: BackendMonitor,
}

impl Gateway {
    /// Relative `models_path` values resolve under `home`.
    pub fn from_provider(provider: &dyn ConfigProvider, home: &Path) -> Result<Self> {
        let mut config: OrchestratorConfig = module_config_typed(provider, ORCHESTRATOR_MODULE)?;
        config.models_path = resolve_under_home(home, &config.models_path.to_string_lossy())
            .context("invalid orchestrator models_path")?;
        let models: Vec<BackendConfig> = module_config_typed(provider, MODELS_MODULE)?;

        info!(
            models_path = %config.models_path.display(),
            max_backends = config.max_backends,
            backend_kinds = config.backends.len(),
            configured_models = models.len(),
            "orchestrator configured"
        );

        let config = Arc::new(config);
        let configs: Arc<dyn BackendConfigLookup> = Arc::new(StaticBackendConfigs::new(models));
        let registry = BackendRegistry::new(
            Arc::new(LocalProcessSpawner::new(Arc::clone(&config))),
            RegistrySettings::from(config.as_ref()),
        );
        let catalog = ModelCatalog::new(
            Arc::new(ModelDir::new(&config.models_path)),
            Arc::clone(&configs),
        )
        .with_defaults(ModelDefaults {
            threads: config.threads,
            context_size: config.context_size,
        });
        let inference = InferenceService::new(registry.clone(), catalog);
        let monitor =
            BackendMonitor::new(registry.clone(), Arc::new(SysinfoSampler)).with_configs(configs);

        Ok(Self {
            config,
            registry,
            inference,
            monitor,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Models a client could ask for.
    pub fn available_models(&self, filter: Option<&Regex>) -> Result<Vec<String>> {
        Ok(self.inference.catalog().list_models(filter, true)?)
    }

    /// Load every `preload` model concurrently. A model that fails to load
    /// is logged and skipped. Returns how many came up.
    pub async fn preload(&self) -> usize {
        let loads = self.config.preload.iter().map(|model| async move {
            match self.inference.load(model).await {
                Ok(lease) => {
                    info!(%model, pid = ?lease.handle().pid(), "preloaded model");
                    true
                }
                Err(e) => {
                    warn!(%model, error = %e, "preload failed");
                    false
                }
            }
        });
        futures::future::join_all(loads)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    /// Log resource usage of every spawned backend.
    pub async fn report_usage(&self) {
        for backend in self.registry.loaded() {
            if backend.pid.is_none() {
                continue;
            }
            match self.monitor.sample(&backend.key).await {
                Ok(sample) => info!(
                    key = %backend.key,
                    pid = sample.pid,
                    rss_mb = sample.rss_bytes / (1024 * 1024),
                    memory_percent = sample.memory_percent,
                    cpu_percent = sample.cpu_percent,
                    "backend resource usage"
                ),
                Err(e) => warn!(key = %backend.key, error = %e, "no resource usage"),
            }
        }
    }

    /// Stop every backend; gives up after `timeout`. Returns whether all
    /// backends stopped in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let backends = self.registry.len();
        match tokio::time::timeout(timeout, self.registry.shutdown()).await {
            Ok(()) => {
                info!(backends, "all backends stopped");
                true
            }
            Err(_) => {
                warn!(backends, ?timeout, "backend shutdown timed out");
                false
            }
        }
    }
}
