use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Normalized model/backend name. Only the file-name component of the input
/// is kept so `models/foo.gguf` and `foo.gguf` address the same backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey(String);

impl BackendKey {
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        let name = Path::new(raw.trim())
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::trim)
            .unwrap_or_default();
        if name.is_empty() {
            return Err(OrchestratorError::InvalidKey(raw.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BackendKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Everything needed to start a backend and load one model into it.
///
/// Plain data: building or cloning it never touches registry state.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Backend kind (`llama-cpp`, `transformers`, ...). Inferred from the
    /// model file when `None`.
    pub backend: Option<String>,
    /// Model file; relative paths are resolved against the models directory.
    pub model_file: PathBuf,
    pub threads: u32,
    pub context_size: u32,
    pub f16: bool,
    pub quantization: Option<String>,
    pub gpu_layers: u32,
    pub mmap: bool,
    pub seed: i32,
    /// Address of an externally managed backend; skips process creation.
    pub grpc_address: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            backend: None,
            model_file: PathBuf::new(),
            threads: 4,
            context_size: 512,
            f16: false,
            quantization: None,
            gpu_layers: 0,
            mmap: true,
            seed: -1,
            grpc_address: None,
        }
    }
}

impl LoadOptions {
    pub fn new(model_file: impl Into<PathBuf>) -> Self {
        Self {
            model_file: model_file.into(),
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_f16(mut self, f16: bool) -> Self {
        self.f16 = f16;
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }

    pub fn with_gpu_layers(mut self, gpu_layers: u32) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }

    pub fn with_mmap(mut self, mmap: bool) -> Self {
        self.mmap = mmap;
        self
    }

    pub fn with_seed(mut self, seed: i32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_grpc_address(mut self, address: impl Into<String>) -> Self {
        self.grpc_address = Some(address.into());
        self
    }

    /// Absolute model path: `model_file` as is when absolute, else under `models_path`.
    pub fn model_path_in(&self, models_path: &Path) -> PathBuf {
        if self.model_file.is_absolute() {
            self.model_file.clone()
        } else {
            models_path.join(&self.model_file)
        }
    }
}
