// ABOUTME: Offshore node: internet-facing executor for framed proxy requests
// ABOUTME: Accepts ship links and runs one dispatcher per accepted connection

use crate::config::OffshoreConfig;
use crate::error::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub mod dispatcher;

/// Bind the offshore link port and serve forever.
pub async fn run(config: OffshoreConfig) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    serve(listener, config).await
}

/// Accept ship links on an already-bound listener.
///
/// Each accepted socket gets an independent dispatcher; when the socket
/// closes or errors, the dispatcher and any live tunnel upstream go with it.
pub async fn serve(listener: TcpListener, config: OffshoreConfig) -> Result<()> {
    info!(addr = %listener.local_addr()?, "offshore proxy listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "ship link accepted");
        let config = config.clone();
        tokio::spawn(async move {
            match dispatcher::run_link(stream, config).await {
                Ok(()) => info!(%peer, "ship link closed"),
                Err(err) => warn!(%peer, error = %err, "ship link failed"),
            }
        });
    }
}
