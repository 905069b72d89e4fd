use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Settings read from `modules.orchestrator.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Directory holding model files; relative model paths resolve here.
    pub models_path: PathBuf,
    /// Upper bound on live + loading backends, 0 = unlimited.
    pub max_backends: usize,
    /// Deadline for spawn plus readiness of one backend.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,
    /// Time between SIGTERM and a forced kill when stopping a backend.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    pub health_check: HealthCheckConfig,
    pub grpc: GrpcSettings,
    /// Launch recipe per backend kind.
    pub backends: HashMap<String, LaunchRecipe>,
    /// Externally managed backends per kind, as `host:port` or a URI.
    pub external_backends: HashMap<String, String>,
    /// Kind used when neither the request nor the model file decide it.
    pub default_backend: Option<String>,
    /// Models loaded at startup.
    pub preload: Vec<String>,
    /// Defaults applied when a model config leaves them unset.
    pub threads: u32,
    pub context_size: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            models_path: PathBuf::from("models"),
            max_backends: 0,
            load_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            health_check: HealthCheckConfig::default(),
            grpc: GrpcSettings::default(),
            backends: HashMap::new(),
            external_backends: HashMap::new(),
            default_backend: None,
            preload: Vec::new(),
            threads: 4,
            context_size: 512,
        }
    }
}

/// Readiness polling backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrpcSettings {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// How to start a backend of one kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LaunchRecipe {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}
