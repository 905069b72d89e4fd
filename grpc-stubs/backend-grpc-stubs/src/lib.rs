//! Generated gRPC stubs for the Backend service
//!
//! This crate contains only the generated protobuf types and gRPC client/server stubs
//! spoken between the orchestrator and backend worker processes. It does not contain
//! any business logic.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Generated protobuf types for the Backend service
pub mod pb {
    tonic::include_proto!("infergate.backend.v1");
}

// Re-export common types for convenience
pub use pb::backend_client::BackendClient;
pub use pb::backend_server::{Backend, BackendServer};
pub use pb::status_response::State as BackendState;
pub use pb::{
    HealthMessage, LoadResult, ModelOptions, PredictOptions, Reply, StatusResponse,
    TokenizationResponse,
};
