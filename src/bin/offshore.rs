// ABOUTME: Offshore binary: internet-facing proxy node, configured from the environment

use shiplink::config::OffshoreConfig;
use shiplink::offshore;
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

    let config = match OffshoreConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = offshore::run(config).await {
        error!(error = %err, "offshore proxy terminated");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
