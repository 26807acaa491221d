// ABOUTME: Ship node: the client-facing HTTP forward proxy server
// ABOUTME: Accepts proxy requests and CONNECT, feeding the FIFO link scheduler

use crate::config::ShipConfig;
use crate::error::{ProxyError, Result};
use crate::http;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub mod scheduler;

pub use scheduler::SchedulerHandle;

/// Bind the ship's proxy port and serve forever.
pub async fn run(config: ShipConfig) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    serve(listener, config).await
}

/// Serve client connections on an already-bound listener.
pub async fn serve(listener: TcpListener, config: ShipConfig) -> Result<()> {
    let scheduler = scheduler::spawn(config.clone());
    info!(addr = %listener.local_addr()?, "ship proxy listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let scheduler = scheduler.clone();
        let request_timeout = config.request_timeout;
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, scheduler, request_timeout).await {
                debug!(%peer, error = %err, "client connection ended");
            }
        });
    }
}

/// Drive one client connection: sequential transactions on a keep-alive
/// connection, or a one-way trip into tunnel mode on CONNECT.
async fn handle_client(
    mut stream: TcpStream,
    scheduler: SchedulerHandle,
    request_timeout: Duration,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let head = match http::read_request_head(&mut stream, &mut buf).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(ProxyError::Client(msg)) => {
                let resp = http::synthesize_response(400, "Bad Request", &msg);
                let _ = stream.write_all(&resp).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if head.is_connect() {
            let connect = http::serialize_request(&head, b"");
            // Bytes the client sent past the CONNECT head (typically an
            // eager TLS ClientHello) must reach the origin first.
            let early = buf.split().freeze();
            let _ = scheduler.open_tunnel(connect, early, stream).await;
            return Ok(());
        }

        match client_exchange(&mut stream, &mut buf, &head, &scheduler, request_timeout).await {
            Ok(close) => {
                if close {
                    return Ok(());
                }
            }
            Err(ProxyError::Client(msg)) => {
                let resp = http::synthesize_response(400, "Bad Request", &msg);
                let _ = stream.write_all(&resp).await;
                return Ok(());
            }
            Err(err) => {
                let resp = http::synthesize_response(502, "Bad Gateway", &err.to_string());
                let _ = stream.write_all(&resp).await;
                return Ok(());
            }
        }
    }
}

/// Run one message-mode transaction end to end. Returns whether the client
/// connection should close afterwards.
async fn client_exchange(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    head: &http::RequestHead,
    scheduler: &SchedulerHandle,
    request_timeout: Duration,
) -> Result<bool> {
    if head.header("transfer-encoding").is_some() {
        return Err(ProxyError::Client(
            "chunked request bodies are not supported".into(),
        ));
    }
    let body_len = head.content_length()?.unwrap_or(0);
    let body = http::read_body(stream, buf, body_len).await?;

    let request = http::serialize_request(head, &body);
    let (response, flushed) = scheduler.exchange(request, request_timeout).await?;

    // The payload is already canonical wire form; validate the head, then
    // pass it through verbatim.
    http::response_status(&response)?;
    stream.write_all(&response).await?;
    let _ = flushed.send(());

    Ok(head.wants_close())
}
