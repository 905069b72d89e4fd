//! Backend worker process toolkit
//!
//! A backend process wraps one inference engine and serves it to the
//! orchestrator over the `Backend` gRPC service. This crate provides the
//! service side of that contract:
//!
//! - [`InferenceBackend`]: the engine hooks (load, predict, stream, tokenize)
//! - [`BackendService`]: load-state bookkeeping and the gRPC adapter
//! - [`BackendArgs`] and [`run_backend`]: the command line the orchestrator
//!   launches processes with, and a signal-aware server loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use clap::Parser;
//! use infergate_backend_sdk::{run_backend, BackendArgs};
//! # use infergate_backend_sdk::{BackendError, InferenceBackend};
//! # use backend_grpc_stubs::{ModelOptions, PredictOptions, Reply};
//! # struct MyEngine;
//! # #[async_trait::async_trait]
//! # impl InferenceBackend for MyEngine {
//! #     async fn load(&self, _: ModelOptions) -> Result<(), BackendError> { Ok(()) }
//! #     async fn predict(&self, _: PredictOptions) -> Result<Reply, BackendError> { Ok(Reply::default()) }
//! # }
//!
//! #[derive(Parser)]
//! struct Cli {
//!     #[command(flatten)]
//!     backend: BackendArgs,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run_backend(Cli::parse().backend, MyEngine).await
//! }
//! ```

mod run;
mod service;
mod state;

pub use run::{backend_logging_config, run_backend, BackendArgs};
pub use service::{BackendError, BackendService, InferenceBackend, TokenSender};
pub use state::LoadState;
