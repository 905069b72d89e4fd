use crate::config::{module_config_from_value, AppConfig};
use anyhow::Result;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Read-only access to configuration for components that should not see the
/// whole `AppConfig`.
pub trait ConfigProvider: Send + Sync {
    /// Raw `modules.<name>` entry, if present.
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value>;

    /// Global section by name (`server`, `logging`).
    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value>;
}

/// Deserialize `modules.<name>.config` through any provider.
pub fn module_config_typed<T>(provider: &dyn ConfigProvider, module_name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    module_config_from_value(provider.get_module_config(module_name), module_name)
}

/// `ConfigProvider` backed by a shared `AppConfig`.
#[derive(Clone)]
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.0.modules.get(module_name)
    }

    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "server" => serde_json::to_value(&self.0.server).ok(),
            "logging" => self
                .0
                .logging
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize)]
    struct Limits {
        max_backends: usize,
    }

    #[test]
    fn typed_module_config_through_provider() {
        let mut config = AppConfig::default();
        config.modules.insert(
            "orchestrator".into(),
            serde_json::json!({ "config": { "max_backends": 2 } }),
        );
        let provider = AppConfigProvider::new(config);

        let limits: Limits = module_config_typed(&provider, "orchestrator").unwrap();
        assert_eq!(limits.max_backends, 2);

        let missing: Limits = module_config_typed(&provider, "absent").unwrap();
        assert_eq!(missing.max_backends, 0);
    }

    #[test]
    fn raw_sections_are_exposed() {
        let provider = AppConfigProvider::new(AppConfig::default());
        assert!(provider.get_config_raw("server").is_some());
        assert!(provider.get_config_raw("logging").is_some());
        assert!(provider.get_config_raw("database").is_none());
    }
}
