//! Backend process orchestration for the inference gateway.
//!
//! The [`BackendRegistry`] decides which worker process serves a model:
//! it starts backends through a [`BackendSpawner`], guarantees a single
//! concurrent load per key, evicts idle backends when capacity is reached
//! and tears processes down on unload or shutdown. Request handlers
//! usually go through [`InferenceService`], which resolves model names via
//! the [`ModelCatalog`].

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod handle;
pub mod inference;
pub mod lease;
pub mod monitor;
pub mod options;
pub mod registry;
pub mod spawner;

pub use catalog::{
    BackendConfig, BackendConfigLookup, ModelCatalog, ModelDefaults, ModelDir, ModelFileLookup,
    StaticBackendConfigs,
};
pub use client::{
    BackendClient, BackendStatus, ClientError, Endpoint, GrpcBackendClient, GrpcClientConfig,
    ModelOptions, PredictRequest, Prediction, RemoteState, TokenStream, Tokenization,
};
pub use config::{GrpcSettings, HealthCheckConfig, LaunchRecipe, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use fanout::{raw_merge, reduce_merge, transform, FanIn};
pub use handle::{BackendHandle, BackendInfo, BackendState};
pub use inference::InferenceService;
pub use lease::{BackendLease, LeasedStream};
pub use monitor::{BackendMonitor, NoopSampler, ResourceSample, ResourceSampler, SysinfoSampler};
pub use options::{BackendKey, LoadOptions};
pub use registry::{BackendRegistry, RegistrySettings};
pub use spawner::{BackendProcess, BackendSpawner, LocalProcessSpawner, SpawnedBackend};
