//! Spawns backends as local child processes, or attaches to external ones.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::launch::{backend_args, free_local_port, infer_kind};
use super::process::BackendProcess;
use super::{BackendSpawner, SpawnedBackend};
use crate::client::{
    BackendClient, Endpoint, GrpcBackendClient, GrpcClientConfig, ModelOptions, RemoteState,
};
use crate::config::{HealthCheckConfig, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::options::{BackendKey, LoadOptions};

const LOOPBACK: &str = "127.0.0.1";
const ATTACHED_KIND: &str = "external";

/// Production [`BackendSpawner`].
pub struct LocalProcessSpawner {
    config: Arc<OrchestratorConfig>,
}

impl LocalProcessSpawner {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        Self { config }
    }

    fn client_for(&self, key: &BackendKey, endpoint: &Endpoint) -> Result<Arc<dyn BackendClient>> {
        let cfg = GrpcClientConfig::new(format!("backend:{key}")).with_settings(&self.config.grpc);
        let client = GrpcBackendClient::connect_lazy(endpoint, &cfg)
            .map_err(|e| OrchestratorError::spawn_failed(key, e))?;
        Ok(Arc::new(client))
    }

    fn model_options(&self, key: &BackendKey, model_path: &Path, options: &LoadOptions) -> ModelOptions {
        ModelOptions {
            model: key.to_string(),
            model_file: model_path.to_string_lossy().into_owned(),
            model_path: self.config.models_path.to_string_lossy().into_owned(),
            context_size: options.context_size,
            threads: options.threads,
            gpu_layers: options.gpu_layers,
            f16_memory: options.f16,
            quantization: options.quantization.clone(),
            mmap: options.mmap,
            seed: options.seed,
        }
    }

    async fn attach(
        &self,
        key: &BackendKey,
        kind: String,
        address: &str,
        model: &ModelOptions,
    ) -> Result<SpawnedBackend> {
        let endpoint = Endpoint::from_uri(address);
        tracing::info!(%key, %kind, %endpoint, "attaching to external backend");
        let client = self.client_for(key, &endpoint)?;
        wait_ready(key, None, client.as_ref(), model, &self.config.health_check).await?;
        Ok(SpawnedBackend {
            kind,
            endpoint,
            client,
            process: None,
        })
    }
}

#[async_trait]
impl BackendSpawner for LocalProcessSpawner {
    async fn spawn(&self, key: &BackendKey, options: &LoadOptions) -> Result<SpawnedBackend> {
        let model_path = options.model_path_in(&self.config.models_path);
        let model = self.model_options(key, &model_path, options);
        let kind = infer_kind(options, &model_path, self.config.default_backend.as_deref()).await;

        if let Some(address) = options.grpc_address.as_deref() {
            let kind = kind.unwrap_or_else(|| ATTACHED_KIND.to_string());
            return self.attach(key, kind, address, &model).await;
        }

        let kind = kind.ok_or_else(|| {
            OrchestratorError::spawn_failed(
                key,
                format!("cannot determine backend kind for {}", model_path.display()),
            )
        })?;

        if let Some(address) = self.config.external_backends.get(&kind) {
            return self.attach(key, kind.clone(), address, &model).await;
        }

        let recipe = self.config.backends.get(&kind).ok_or_else(|| {
            OrchestratorError::spawn_failed(key, format!("no executable configured for backend kind '{kind}'"))
        })?;

        let port = free_local_port().map_err(|e| OrchestratorError::spawn_failed(key, e))?;
        let addr = format!("{LOOPBACK}:{port}");
        let endpoint = Endpoint::tcp(LOOPBACK, port);
        let args = backend_args(recipe, &addr, &model_path, options);

        let child = Command::new(&recipe.executable)
            .args(&args)
            .envs(&recipe.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = child.map_err(|e| {
            OrchestratorError::spawn_failed(
                key,
                format!("failed to start {}: {e}", recipe.executable.display()),
            )
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(key.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(key.clone(), "stderr", stderr);
        }

        let mut process = BackendProcess::new(child);
        tracing::info!(
            %key,
            %kind,
            pid = ?process.pid(),
            %endpoint,
            executable = %recipe.executable.display(),
            "spawned backend process"
        );

        let client = match self.client_for(key, &endpoint) {
            Ok(client) => client,
            Err(e) => {
                process.kill().await;
                return Err(e);
            }
        };

        let ready = wait_ready(
            key,
            Some(&mut process),
            client.as_ref(),
            &model,
            &self.config.health_check,
        )
        .await;
        if let Err(e) = ready {
            process.kill().await;
            return Err(e);
        }

        Ok(SpawnedBackend {
            kind,
            endpoint,
            client,
            process: Some(process),
        })
    }
}

/// Poll `status()` with exponential backoff until the backend reports
/// `Ready`. A fresh backend (`Uninitialized`) is sent the model once. The
/// child is checked before every poll so an early exit fails fast.
pub(crate) async fn wait_ready(
    key: &BackendKey,
    mut process: Option<&mut BackendProcess>,
    client: &dyn BackendClient,
    model: &ModelOptions,
    health: &HealthCheckConfig,
) -> Result<()> {
    let mut backoff = health.initial_backoff;
    let mut load_sent = false;

    loop {
        if let Some(process) = process.as_mut() {
            if let Some(exit) = process.exit_status() {
                let reason = match exit {
                    Ok(status) => format!("backend exited before becoming ready ({status})"),
                    Err(e) => format!("backend process state unknown: {e}"),
                };
                return Err(OrchestratorError::spawn_failed(key, reason));
            }
        }

        match client.status().await {
            Ok(status) => match status.state {
                RemoteState::Ready => {
                    tracing::debug!(%key, "backend reported ready");
                    return Ok(());
                }
                RemoteState::Uninitialized if !load_sent => {
                    load_sent = true;
                    tracing::debug!(%key, model_file = %model.model_file, "loading model into backend");
                    match client.load(model).await {
                        Ok(()) => continue,
                        Err(e) if e.is_transport() => load_sent = false,
                        Err(e) => {
                            return Err(OrchestratorError::spawn_failed(
                                key,
                                format!("model load failed: {e}"),
                            ))
                        }
                    }
                }
                RemoteState::Uninitialized | RemoteState::Loading => {}
                RemoteState::Error => {
                    return Err(OrchestratorError::spawn_failed(
                        key,
                        format!("backend reported error: {}", status.message),
                    ))
                }
            },
            Err(e) if e.is_transport() => {
                tracing::trace!(%key, error = %e, "backend not reachable yet");
            }
            Err(e) => return Err(OrchestratorError::spawn_failed(key, e)),
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(health.max_backoff);
    }
}

fn forward_output<R>(key: BackendKey, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(backend = %key, stream, "{line}");
        }
    });
}
