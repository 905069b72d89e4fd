//! Model files on disk and the backend configs that reference them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::options::LoadOptions;

/// Extensions of files living next to models that are not models.
const NON_MODEL_EXTENSIONS: &[&str] = &["tmpl", "yaml", "yml", "json", "md", "partial", "keep"];

/// Per-model backend settings, as found under `modules.models.config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Name clients ask for.
    pub name: String,
    /// Backend kind; inferred from the model file when absent.
    #[serde(default)]
    pub backend: Option<String>,
    /// Model file, relative to the models directory or absolute.
    pub model: String,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub f16: bool,
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    #[serde(default)]
    pub mmap: Option<bool>,
    #[serde(default)]
    pub seed: Option<i32>,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub grpc_address: Option<String>,
}

pub trait ModelFileLookup: Send + Sync {
    fn model_path(&self) -> &Path;

    fn exists_in_model_path(&self, name: &str) -> bool;

    /// Model file names, sorted.
    fn list_models(&self) -> Result<Vec<String>>;
}

pub trait BackendConfigLookup: Send + Sync {
    fn backend_config(&self, name: &str) -> Option<BackendConfig>;

    /// All configs, sorted by name.
    fn all_configs(&self) -> Vec<BackendConfig>;
}

/// A directory of model files.
#[derive(Debug, Clone)]
pub struct ModelDir {
    path: PathBuf,
}

impl ModelDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn is_model_file(name: &str) -> bool {
        if name.starts_with('.') {
            return false;
        }
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        !matches!(ext, Some(ext) if NON_MODEL_EXTENSIONS.contains(&ext.as_str()))
    }
}

impl ModelFileLookup for ModelDir {
    fn model_path(&self) -> &Path {
        &self.path
    }

    fn exists_in_model_path(&self, name: &str) -> bool {
        // Only plain file names; anything with a path component is rejected.
        let Some(file_name) = Path::new(name).file_name() else {
            return false;
        };
        if file_name != name {
            return false;
        }
        self.path.join(file_name).is_file()
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.path).map_err(|e| {
            OrchestratorError::Catalog(format!(
                "models directory {} is unreadable: {e}",
                self.path.display()
            ))
        })?;

        let mut models: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| Self::is_model_file(name))
            .collect();
        models.sort();
        Ok(models)
    }
}

/// Backend configs fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticBackendConfigs {
    configs: BTreeMap<String, BackendConfig>,
}

impl StaticBackendConfigs {
    pub fn new(configs: impl IntoIterator<Item = BackendConfig>) -> Self {
        let configs = configs
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        Self { configs }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let configs: Vec<BackendConfig> = serde_yaml::from_str(yaml)?;
        Ok(Self::new(configs))
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl BackendConfigLookup for StaticBackendConfigs {
    fn backend_config(&self, name: &str) -> Option<BackendConfig> {
        self.configs.get(name).cloned()
    }

    fn all_configs(&self) -> Vec<BackendConfig> {
        self.configs.values().cloned().collect()
    }
}

/// Defaults for settings a config leaves open.
#[derive(Debug, Clone, Copy)]
pub struct ModelDefaults {
    pub threads: u32,
    pub context_size: u32,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        let base = LoadOptions::default();
        Self {
            threads: base.threads,
            context_size: base.context_size,
        }
    }
}

/// Joins model files and backend configs.
#[derive(Clone)]
pub struct ModelCatalog {
    files: Arc<dyn ModelFileLookup>,
    configs: Arc<dyn BackendConfigLookup>,
    defaults: ModelDefaults,
}

impl ModelCatalog {
    pub fn new(files: Arc<dyn ModelFileLookup>, configs: Arc<dyn BackendConfigLookup>) -> Self {
        Self {
            files,
            configs,
            defaults: ModelDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: ModelDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn configs(&self) -> &Arc<dyn BackendConfigLookup> {
        &self.configs
    }

    pub fn files(&self) -> &Arc<dyn ModelFileLookup> {
        &self.files
    }

    /// Configured names first, then loose model files. With
    /// `exclude_configured`, files referenced by a config are left out.
    /// `filter` applies to names of both kinds.
    pub fn list_models(&self, filter: Option<&Regex>, exclude_configured: bool) -> Result<Vec<String>> {
        let matches = |name: &str| filter.map_or(true, |re| re.is_match(name));

        let configs = self.configs.all_configs();
        let referenced: HashSet<&str> = if exclude_configured {
            configs.iter().map(|c| c.model.as_str()).collect()
        } else {
            HashSet::new()
        };

        let mut names: Vec<String> = configs
            .iter()
            .filter(|c| matches(&c.name))
            .map(|c| c.name.clone())
            .collect();

        names.extend(
            self.files
                .list_models()?
                .into_iter()
                .filter(|file| !referenced.contains(file.as_str()) && matches(file)),
        );
        Ok(names)
    }

    /// Load options for a configured name or a loose model file.
    pub fn load_options_for(&self, name: &str) -> Result<LoadOptions> {
        if let Some(config) = self.configs.backend_config(name) {
            return Ok(self.options_from_config(&config));
        }
        if self.files.exists_in_model_path(name) {
            return Ok(LoadOptions::new(name)
                .with_threads(self.defaults.threads)
                .with_context_size(self.defaults.context_size));
        }
        Err(OrchestratorError::BackendNotFound(name.to_string()))
    }

    fn options_from_config(&self, config: &BackendConfig) -> LoadOptions {
        let base = LoadOptions::default();
        LoadOptions {
            backend: config.backend.clone(),
            model_file: PathBuf::from(&config.model),
            threads: config.threads.unwrap_or(self.defaults.threads),
            context_size: config.context_size.unwrap_or(self.defaults.context_size),
            f16: config.f16,
            quantization: config.quantization.clone(),
            gpu_layers: config.gpu_layers.unwrap_or(base.gpu_layers),
            mmap: config.mmap.unwrap_or(base.mmap),
            seed: config.seed.unwrap_or(base.seed),
            grpc_address: config.grpc_address.clone(),
        }
    }
}
