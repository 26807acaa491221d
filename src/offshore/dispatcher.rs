// ABOUTME: Per-link dispatcher: consumes framed requests and executes them
// ABOUTME: Plain HTTP/HTTPS fetches go through the origin client, CONNECT gets a raw TCP tunnel

use crate::codec::{Frame, FrameType};
use crate::config::OffshoreConfig;
use crate::error::{ProxyError, Result};
use crate::http;
use crate::link::{self, FrameSender};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const TUNNEL_CHUNK: usize = 16 * 1024;

/// Drive one ship link until it closes.
///
/// Frames are consumed strictly in order; a request is fully executed and
/// answered before the next one is looked at, which is the offshore half of
/// the one-at-a-time contract.
pub async fn run_link(stream: TcpStream, config: OffshoreConfig) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let sender = FrameSender::spawn(write);
    let mut frames = link::spawn_reader(read, config.max_frame_len);

    let origin = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .map_err(|err| ProxyError::Upstream(err.to_string()))?;

    while let Some(frame) = frames.recv().await {
        if frame.frame_type != FrameType::Request {
            warn!("unexpected RESPONSE frame from ship in message mode");
            continue;
        }
        handle_request(frame.payload, &sender, &mut frames, &origin).await?;
    }
    Ok(())
}

/// Execute one framed request. `Err` means the link itself died.
async fn handle_request(
    payload: Bytes,
    sender: &FrameSender,
    frames: &mut mpsc::Receiver<Frame>,
    origin: &reqwest::Client,
) -> Result<()> {
    let (head, body) = match http::parse_request(&payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "unparsable request blob");
            let resp =
                http::synthesize_response(500, "Internal Server Error", &err.to_string());
            return sender.send(FrameType::Response, resp).await;
        }
    };

    if head.is_connect() {
        return run_tunnel(&head, sender, frames).await;
    }

    let response = match fetch_origin(origin, &head, body).await {
        Ok(blob) => blob,
        Err(err @ ProxyError::Parse(_)) => {
            debug!(error = %err, "request not executable");
            http::synthesize_response(500, "Internal Server Error", &err.to_string())
        }
        Err(err) => {
            warn!(error = %err, target = %head.target, "origin fetch failed");
            http::synthesize_response(502, "Bad Gateway", &err.to_string())
        }
    };
    sender.send(FrameType::Response, response).await
}

/// Perform the origin fetch for a non-CONNECT request and build the
/// response blob. TLS happens here when the target URL is `https`.
async fn fetch_origin(
    origin: &reqwest::Client,
    head: &http::RequestHead,
    body: Bytes,
) -> Result<Bytes> {
    let url = http::target_url(head)?;
    let method = reqwest::Method::from_bytes(head.method.as_bytes())
        .map_err(|_| ProxyError::Parse(format!("invalid method {:?}", head.method)))?;

    let mut request = origin.request(method, &url);
    for (name, value) in &head.headers {
        if http::is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request
        .body(body)
        .send()
        .await
        .map_err(|err| ProxyError::Upstream(error_chain(&err)))?;

    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("");
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|err| ProxyError::Upstream(error_chain(&err)))?;

    Ok(http::build_response(status.as_u16(), reason, &headers, &body))
}

/// Full CONNECT tunnel lifecycle on the offshore side. `Ok(())` means the
/// tunnel finished and message mode is restored; `Err` means the link died.
async fn run_tunnel(
    head: &http::RequestHead,
    sender: &FrameSender,
    frames: &mut mpsc::Receiver<Frame>,
) -> Result<()> {
    let authority = http::connect_authority(&head.target);
    let upstream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%authority, error = %err, "CONNECT target unreachable");
            let resp = http::synthesize_response(
                502,
                "Bad Gateway",
                &format!("CONNECT {authority} failed: {err}"),
            );
            return sender.send(FrameType::Response, resp).await;
        }
    };
    let _ = upstream.set_nodelay(true);
    info!(%authority, "tunnel established");

    sender
        .send(
            FrameType::Response,
            Bytes::from_static(b"HTTP/1.1 200 Connection Established\r\n\r\n"),
        )
        .await?;

    let (up_read, up_write) = upstream.into_split();
    let (stop, stop_rx) = oneshot::channel();
    let (fin_tx, mut fin_rx) = oneshot::channel();
    tokio::spawn(pump_upstream(up_read, sender.clone(), stop_rx, fin_tx));

    let mut up_write = Some(up_write);
    let mut stop = Some(stop);

    loop {
        tokio::select! {
            fin = &mut fin_rx => {
                if fin.is_err() {
                    return Err(ProxyError::LinkClosed);
                }
                // Upstream closed on its own; the pump already emitted the
                // empty end-of-tunnel frame. Discard stale tunnel bytes
                // until the ship's empty confirmation restores message mode.
                drop(up_write.take());
                loop {
                    match frames.recv().await {
                        None => return Err(ProxyError::LinkClosed),
                        Some(frame)
                            if frame.frame_type == FrameType::Request
                                && frame.payload.is_empty() =>
                        {
                            debug!("tunnel closed by upstream");
                            return Ok(());
                        }
                        Some(_) => {}
                    }
                }
            },
            frame = frames.recv() => match frame {
                None => return Err(ProxyError::LinkClosed),
                Some(frame) if frame.frame_type != FrameType::Request => {
                    warn!("unexpected RESPONSE frame while tunneling");
                }
                Some(frame) if frame.payload.is_empty() => {
                    // Ship closed the client side. Stop the pump; it emits
                    // the empty acknowledgement after its final data frame,
                    // so the ship's drain always terminates.
                    drop(up_write.take());
                    if let Some(stop) = stop.take() {
                        let _ = stop.send(());
                    }
                    if (&mut fin_rx).await.is_err() {
                        return Err(ProxyError::LinkClosed);
                    }
                    debug!("tunnel closed by ship");
                    return Ok(());
                }
                Some(frame) => {
                    if let Some(writer) = up_write.as_mut() {
                        if writer.write_all(&frame.payload).await.is_err() {
                            // Upstream is gone; drop the write half and let
                            // the pump notice EOF. Tunnel bytes with no
                            // destination are dropped silently.
                            drop(up_write.take());
                        }
                    }
                }
            },
        }
    }
}

/// Forward upstream bytes to the ship as RESPONSE frames.
///
/// Exactly one empty RESPONSE frame ends every tunnel, always ordered after
/// the last data frame because both go through the serialized sender.
async fn pump_upstream(
    mut up_read: OwnedReadHalf,
    sender: FrameSender,
    mut stop: oneshot::Receiver<()>,
    fin: oneshot::Sender<()>,
) {
    let mut chunk = vec![0u8; TUNNEL_CHUNK];
    loop {
        tokio::select! {
            _ = &mut stop => break,
            read = up_read.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&chunk[..n]);
                    if sender.send(FrameType::Response, data).await.is_err() {
                        // Link died; dropping `fin` tells the dispatcher.
                        return;
                    }
                }
            },
        }
    }
    if sender.send(FrameType::Response, Bytes::new()).await.is_err() {
        return;
    }
    let _ = fin.send(());
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
