use anyhow::Result;
use clap::Parser;
use echo_backend::{EchoBackend, EchoSettings};
use infergate_backend_sdk::{run_backend, BackendArgs};
use std::time::Duration;

/// Echo Backend - answers every prompt with the prompt itself
#[derive(Parser)]
#[command(name = "echo-backend")]
#[command(about = "Echo Backend - answers every prompt with the prompt itself")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    /// Simulated model load time in milliseconds
    #[arg(long, env = "ECHO_LOAD_DELAY_MS", default_value_t = 0)]
    load_delay_ms: u64,

    /// Pause between streamed words in milliseconds
    #[arg(long, env = "ECHO_TOKEN_DELAY_MS", default_value_t = 0)]
    token_delay_ms: u64,

    /// Exit with this code right after start, before serving
    #[arg(long, env = "ECHO_EXIT_CODE")]
    exit_code: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(code) = cli.exit_code {
        eprintln!("echo-backend: exiting with code {code} as requested");
        std::process::exit(code);
    }

    let backend = EchoBackend::new(EchoSettings {
        load_delay: Duration::from_millis(cli.load_delay_ms),
        token_delay: Duration::from_millis(cli.token_delay_ms),
    });
    run_backend(cli.backend, backend).await
}
