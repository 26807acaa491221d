// ABOUTME: FIFO transaction scheduler and link manager for the ship node
// ABOUTME: One worker owns the offshore link; tunnels run inline and block the queue

use crate::codec::{Frame, FrameType};
use crate::config::ShipConfig;
use crate::error::{ProxyError, Result};
use crate::http;
use crate::link::{self, FrameSender};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const JOB_QUEUE_DEPTH: usize = 256;
const TUNNEL_CHUNK: usize = 16 * 1024;

enum Job {
    Exchange {
        request: Bytes,
        respond: oneshot::Sender<Result<Bytes>>,
        flushed: oneshot::Receiver<()>,
    },
    Tunnel {
        connect: Bytes,
        early: Bytes,
        client: TcpStream,
    },
}

/// Handle the client side uses to tell the worker its response has been
/// flushed. Dropping it counts as flushed, so an abandoned client never
/// stalls the queue.
pub type FlushToken = oneshot::Sender<()>;

/// Cheap handle the HTTP server uses to submit work to the link worker.
///
/// Jobs are processed strictly one at a time in submission order; responses
/// correlate positionally with requests, which is what makes the shared
/// link's frame stream unambiguous.
#[derive(Clone)]
pub struct SchedulerHandle {
    jobs: mpsc::Sender<Job>,
}

impl SchedulerHandle {
    /// Submit a serialized request blob and wait for its response payload.
    ///
    /// `deadline` bounds the whole trip, queue wait included; past it the
    /// transaction fails as `UpstreamUnavailable` and the worker discards
    /// the eventual response. The worker does not start the next queued
    /// item until the returned [`FlushToken`] is fired (or dropped), which
    /// is what extends link pacing all the way to the client write.
    pub async fn exchange(&self, request: Bytes, deadline: Duration) -> Result<(Bytes, FlushToken)> {
        let (respond, rx) = oneshot::channel();
        let (flush_tx, flushed) = oneshot::channel();
        self.jobs
            .send(Job::Exchange {
                request,
                respond,
                flushed,
            })
            .await
            .map_err(|_| ProxyError::LinkClosed)?;
        match timeout(deadline, rx).await {
            Err(_) => Err(ProxyError::UpstreamUnavailable),
            Ok(Err(_)) => Err(ProxyError::LinkClosed),
            Ok(Ok(result)) => result.map(|payload| (payload, flush_tx)),
        }
    }

    /// Hand a CONNECT client over to the worker. The worker owns the socket
    /// from here on and runs the whole tunnel lifecycle inline.
    pub async fn open_tunnel(&self, connect: Bytes, early: Bytes, client: TcpStream) -> Result<()> {
        self.jobs
            .send(Job::Tunnel {
                connect,
                early,
                client,
            })
            .await
            .map_err(|_| ProxyError::LinkClosed)
    }
}

pub fn spawn(config: ShipConfig) -> SchedulerHandle {
    let (jobs, rx) = mpsc::channel(JOB_QUEUE_DEPTH);
    tokio::spawn(run(config, rx));
    SchedulerHandle { jobs }
}

enum LinkOutcome {
    /// The link died; rebuild it and keep serving the queue.
    Lost,
    /// Every handle is gone; the ship is shutting down.
    Shutdown,
}

async fn run(config: ShipConfig, mut jobs: mpsc::Receiver<Job>) {
    // A transaction whose REQUEST frame never reached the wire is not
    // in-flight; it survives the link rebuild instead of failing.
    let mut carried: Option<Job> = None;
    loop {
        let stream = connect_with_retry(&config).await;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let sender = FrameSender::spawn(write);
        let mut frames = link::spawn_reader(read, config.max_frame_len);
        info!(
            host = %config.offshore_host,
            port = config.offshore_port,
            "link to offshore established"
        );

        match serve_link(&mut jobs, &mut carried, &sender, &mut frames).await {
            LinkOutcome::Shutdown => return,
            LinkOutcome::Lost => {
                warn!("link to offshore lost, reconnecting");
                sleep(jittered(config.reconnect_delay)).await;
            }
        }
    }
}

async fn connect_with_retry(config: &ShipConfig) -> TcpStream {
    loop {
        match TcpStream::connect((config.offshore_host.as_str(), config.offshore_port)).await {
            Ok(stream) => return stream,
            Err(err) => {
                warn!(
                    error = %err,
                    host = %config.offshore_host,
                    port = config.offshore_port,
                    "offshore connect failed, retrying"
                );
                sleep(jittered(config.reconnect_delay)).await;
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(0.75 + fastrand::f64() * 0.5)
}

/// The FIFO worker: one job at a time against the current link.
async fn serve_link(
    jobs: &mut mpsc::Receiver<Job>,
    carried: &mut Option<Job>,
    sender: &FrameSender,
    frames: &mut mpsc::Receiver<Frame>,
) -> LinkOutcome {
    loop {
        let job = match carried.take() {
            Some(job) => job,
            None => match jobs.recv().await {
                Some(job) => job,
                None => return LinkOutcome::Shutdown,
            },
        };
        match job {
            Job::Exchange {
                request,
                respond,
                mut flushed,
            } => {
                if respond.is_closed() {
                    // The client already gave up waiting; skip the work.
                    continue;
                }
                if sender
                    .send(FrameType::Request, request.clone())
                    .await
                    .is_err()
                {
                    // Never reached the wire; retry it on the next link.
                    *carried = Some(Job::Exchange {
                        request,
                        respond,
                        flushed,
                    });
                    return LinkOutcome::Lost;
                }
                // Positional correlation: the next RESPONSE frame on the
                // link belongs to this transaction.
                match frames.recv().await {
                    Some(frame) if frame.frame_type == FrameType::Response => {
                        if respond.send(Ok(frame.payload)).is_ok() {
                            // Hold the queue until the response has been
                            // flushed to the client (or the client went
                            // away); origin pacing reaches the client.
                            let _ = (&mut flushed).await;
                        }
                    }
                    Some(frame) => {
                        warn!(frame_type = ?frame.frame_type, "unexpected frame in message mode");
                        let _ = respond.send(Err(ProxyError::LinkClosed));
                        return LinkOutcome::Lost;
                    }
                    None => {
                        let _ = respond.send(Err(ProxyError::LinkClosed));
                        return LinkOutcome::Lost;
                    }
                }
            }
            Job::Tunnel {
                connect,
                early,
                client,
            } => {
                if run_tunnel(sender, frames, connect, early, client)
                    .await
                    .is_err()
                {
                    return LinkOutcome::Lost;
                }
            }
        }
    }
}

/// Full CONNECT tunnel lifecycle. `Ok(())` means the tunnel finished and
/// message mode is restored; `Err` means the link itself died.
async fn run_tunnel(
    sender: &FrameSender,
    frames: &mut mpsc::Receiver<Frame>,
    connect: Bytes,
    early: Bytes,
    mut client: TcpStream,
) -> Result<()> {
    if let Err(err) = sender.send(FrameType::Request, connect).await {
        reject_client(&mut client, "offshore link unavailable").await;
        return Err(err);
    }
    let reply = match frames.recv().await {
        Some(frame) => frame,
        None => {
            reject_client(&mut client, "offshore link closed during CONNECT").await;
            return Err(ProxyError::LinkClosed);
        }
    };

    if !matches!(http::response_status(&reply.payload), Ok(200)) {
        // Forward the offshore's verdict verbatim, drop the client, and
        // resume the queue; the offshore never entered tunnel mode.
        let _ = client.write_all(&reply.payload).await;
        let _ = client.shutdown().await;
        return Ok(());
    }

    if client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        // Client vanished before the first tunnel byte.
        return close_tunnel(sender, frames, client).await;
    }
    if !early.is_empty() {
        if let Err(err) = sender.send(FrameType::Request, early).await {
            let _ = client.shutdown().await;
            return Err(err);
        }
    }
    debug!("tunnel established");

    let mut chunk = vec![0u8; TUNNEL_CHUNK];
    loop {
        tokio::select! {
            read = client.read(&mut chunk) => match read {
                Ok(0) | Err(_) => return close_tunnel(sender, frames, client).await,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&chunk[..n]);
                    if let Err(err) = sender.send(FrameType::Request, data).await {
                        let _ = client.shutdown().await;
                        return Err(err);
                    }
                }
            },
            frame = frames.recv() => match frame {
                None => {
                    let _ = client.shutdown().await;
                    return Err(ProxyError::LinkClosed);
                }
                Some(frame) if frame.frame_type != FrameType::Response => {
                    warn!("unexpected REQUEST frame while tunneling");
                }
                Some(frame) if frame.payload.is_empty() => {
                    // Offshore reports upstream EOF. Confirm the teardown
                    // and resume the queue; the offshore stopped sending
                    // after this marker, so nothing stale can follow.
                    let _ = client.shutdown().await;
                    sender.send(FrameType::Request, Bytes::new()).await?;
                    return Ok(());
                }
                Some(frame) => {
                    if client.write_all(&frame.payload).await.is_err() {
                        return close_tunnel(sender, frames, client).await;
                    }
                }
            },
        }
    }
}

/// Ship-initiated teardown: emit the empty end-of-tunnel frame, then discard
/// stale tunnel bytes until the offshore's empty acknowledgement arrives.
/// The drain is what keeps positional correlation safe for the next
/// transaction.
async fn close_tunnel(
    sender: &FrameSender,
    frames: &mut mpsc::Receiver<Frame>,
    mut client: TcpStream,
) -> Result<()> {
    let _ = client.shutdown().await;
    drop(client);

    sender.send(FrameType::Request, Bytes::new()).await?;
    loop {
        match frames.recv().await {
            None => return Err(ProxyError::LinkClosed),
            Some(frame) if frame.payload.is_empty() => return Ok(()),
            Some(_) => {}
        }
    }
}

async fn reject_client(client: &mut TcpStream, reason: &str) {
    let resp = http::synthesize_response(502, "Bad Gateway", reason);
    let _ = client.write_all(&resp).await;
    let _ = client.shutdown().await;
}
