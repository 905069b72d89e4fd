use anyhow::{Context, Result};
use backend_grpc_stubs::{BackendServer, ModelOptions};
use clap::Args;
use infergate_bootstrap::{init_logging_unified, LoggingConfig, Section};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::service::{BackendService, InferenceBackend};

/// Command-line contract between the orchestrator and a backend process.
#[derive(Debug, Clone, Args)]
pub struct BackendArgs {
    /// Address to serve the Backend gRPC service on
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub addr: String,

    /// Model file to load at startup
    #[arg(long)]
    pub model: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    pub threads: u32,

    #[arg(long = "context-size", default_value_t = 512)]
    pub context_size: u32,

    #[arg(long = "gpu-layers", default_value_t = 0)]
    pub gpu_layers: u32,

    /// Handle one inference call at a time
    #[arg(long)]
    pub serialize_calls: bool,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Default for BackendArgs {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:50051".to_string(),
            model: None,
            threads: 4,
            context_size: 512,
            gpu_layers: 0,
            serialize_calls: false,
            verbose: 0,
        }
    }
}

impl BackendArgs {
    /// Options for the startup load, if a model was given.
    pub fn model_options(&self) -> Option<ModelOptions> {
        let path = self.model.as_ref()?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Some(ModelOptions {
            model: file_name,
            model_file: path.to_string_lossy().into_owned(),
            model_path: path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            context_size: to_i32(self.context_size),
            threads: to_i32(self.threads),
            gpu_layers: to_i32(self.gpu_layers),
            mmap: true,
            seed: -1,
            ..Default::default()
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Console-only logging; the orchestrator captures our stderr.
pub fn backend_logging_config(verbose: u8) -> LoggingConfig {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut logging = LoggingConfig::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: level.to_string(),
            file: String::new(),
            file_level: "off".to_string(),
            max_age_days: None,
            max_backups: None,
            max_size_mb: None,
        },
    );
    logging
}

/// Serve `backend` until a termination signal arrives.
pub async fn run_backend<B: InferenceBackend>(args: BackendArgs, backend: B) -> Result<()> {
    init_logging_unified(&backend_logging_config(args.verbose), Path::new("."));

    let addr: SocketAddr = args
        .addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", args.addr))?;

    let mut service = BackendService::new(backend);
    if args.serialize_calls {
        service = service.serialize_calls();
    }

    if let Some(options) = args.model_options() {
        info!(model = %options.model_file, "loading model at startup");
        service.load_in_background(options);
    }

    let cancel = CancellationToken::new();
    infergate_bootstrap::cancel_on_shutdown(cancel.clone());

    info!(%addr, pid = std::process::id(), "backend serving");
    tonic::transport::Server::builder()
        .add_service(BackendServer::new(service))
        .serve_with_shutdown(addr, cancel.cancelled_owned())
        .await
        .context("backend gRPC server failed")?;

    info!("backend stopped");
    Ok(())
}
