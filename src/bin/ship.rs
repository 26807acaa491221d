// ABOUTME: Ship binary: client-facing proxy node, configured from the environment

use shiplink::config::ShipConfig;
use shiplink::ship;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match ShipConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = ship::run(config).await {
        error!(error = %err, "ship proxy terminated");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
