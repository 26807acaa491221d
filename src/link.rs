// ABOUTME: Frame transport over the single ship<->offshore TCP link
// ABOUTME: One serialized writer task and one decoder-driven reader task per link

use crate::codec::{self, Frame, FrameDecoder, FrameType};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

const SEND_QUEUE_DEPTH: usize = 64;
const FRAME_CHANNEL_DEPTH: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

struct SendOp {
    frame: Frame,
    done: oneshot::Sender<Result<()>>,
}

/// Serialized frame sender, one per link.
///
/// All sends funnel through a FIFO queue drained by a single writer task, so
/// at most one socket write is in flight and frame bytes never interleave.
/// `send` resolves once the frame has been written and flushed; after a
/// socket failure every pending and subsequent send fails with `LinkClosed`.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<SendOp>,
}

impl FrameSender {
    /// Spawn the writer task over the link's write half.
    pub fn spawn<W>(write: W) -> FrameSender
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        tokio::spawn(write_loop(write, rx));
        FrameSender { tx }
    }

    /// Enqueue one frame and wait until its bytes have been handed to the OS.
    pub async fn send(&self, frame_type: FrameType, payload: impl Into<Bytes>) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        let op = SendOp {
            frame: Frame {
                frame_type,
                payload: payload.into(),
            },
            done,
        };
        self.tx
            .send(op)
            .await
            .map_err(|_| ProxyError::LinkClosed)?;
        done_rx.await.map_err(|_| ProxyError::LinkClosed)?
    }
}

async fn write_loop<W>(mut write: W, mut rx: mpsc::Receiver<SendOp>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = rx.recv().await {
        let bytes = match codec::encode(&op.frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                // An unencodable payload fails its own send but not the link.
                let _ = op.done.send(Err(err.into()));
                continue;
            }
        };

        let result = async {
            write.write_all(&bytes).await?;
            write.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                let _ = op.done.send(Ok(()));
            }
            Err(err) => {
                warn!(error = %err, "link write failed");
                let _ = op.done.send(Err(ProxyError::LinkClosed));
                break;
            }
        }
    }

    // Fail whatever is still queued so no caller hangs on a dead link.
    rx.close();
    while let Some(op) = rx.recv().await {
        let _ = op.done.send(Err(ProxyError::LinkClosed));
    }
}

/// Spawn the read loop over the link's read half.
///
/// Frames arrive on the returned channel in wire order. The channel closes
/// when the peer disconnects or the decoder hits a protocol error; either
/// way the link is done. The bounded channel applies backpressure to the
/// socket when the consumer falls behind.
pub fn spawn_reader<R>(read: R, max_frame_len: u32) -> mpsc::Receiver<Frame>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
    tokio::spawn(read_loop(read, tx, max_frame_len));
    rx
}

async fn read_loop<R>(mut read: R, tx: mpsc::Sender<Frame>, max_frame_len: u32)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_len(max_frame_len);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match read.read(&mut chunk).await {
            Ok(0) => {
                debug!("link read half closed by peer");
                break;
            }
            Ok(n) => {
                if let Err(err) = decoder.extend(&chunk[..n]) {
                    error!(error = %err, "protocol error on link, dropping connection");
                    break;
                }
                loop {
                    match decoder.try_next() {
                        Ok(Some(frame)) => {
                            if tx.send(frame).await.is_err() {
                                // Consumer went away; stop reading for it.
                                decoder.close();
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            // Frames completed before the corruption were
                            // already delivered; the link dies here.
                            error!(error = %err, "protocol error on link, dropping connection");
                            decoder.close();
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "link read failed");
                break;
            }
        }
    }
    decoder.close();
    // Dropping `tx` closes the frame channel, which is the consumer's
    // LinkClosed signal.
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_then_receive_roundtrip() {
        let (near, far) = duplex(1024);
        let sender = FrameSender::spawn(near);
        let mut frames = spawn_reader(far, codec::DEFAULT_MAX_FRAME_LEN);

        sender
            .send(FrameType::Request, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        sender
            .send(FrameType::Response, Bytes::from_static(b"pong"))
            .await
            .unwrap();

        let first = frames.recv().await.unwrap();
        assert_eq!(first, Frame::request(Bytes::from_static(b"ping")));
        let second = frames.recv().await.unwrap();
        assert_eq!(second, Frame::response(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let (near, far) = duplex(64);
        let sender = FrameSender::spawn(near);
        let mut frames = spawn_reader(far, codec::DEFAULT_MAX_FRAME_LEN);

        let mut tasks = Vec::new();
        for worker in 0u8..4 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0u8..25 {
                    // Distinctive payload per send; a torn frame would fail
                    // decoding or produce a payload not of this shape.
                    let payload = vec![worker, seq, worker, seq, worker, seq];
                    sender
                        .send(FrameType::Request, Bytes::from(payload))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(sender);

        let mut seen = Vec::new();
        while let Some(frame) = frames.recv().await {
            let p = frame.payload.as_ref();
            assert_eq!(p.len(), 6);
            assert_eq!(&p[..2], &p[2..4]);
            assert_eq!(&p[..2], &p[4..6]);
            seen.push((p[0], p[1]));
        }
        assert_eq!(seen.len(), 100);

        // Per-worker FIFO order survives the shared queue.
        for worker in 0u8..4 {
            let per_worker: Vec<u8> = seen
                .iter()
                .filter(|(w, _)| *w == worker)
                .map(|(_, s)| *s)
                .collect();
            let expected: Vec<u8> = (0..25).collect();
            assert_eq!(per_worker, expected);
        }
    }

    #[tokio::test]
    async fn pending_sends_fail_when_peer_drops() {
        let (near, far) = duplex(16);
        let sender = FrameSender::spawn(near);
        drop(far);

        // The first send may still land in the closed pipe's buffer; keep
        // sending until the writer observes the broken pipe.
        let mut failed = false;
        for _ in 0..32 {
            if sender
                .send(FrameType::Request, Bytes::from(vec![0u8; 1024]))
                .await
                .is_err()
            {
                failed = true;
                break;
            }
        }
        assert!(failed, "sends kept succeeding on a dead link");

        // Once dead, every later send fails immediately.
        let err = sender
            .send(FrameType::Request, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::LinkClosed));
    }

    #[tokio::test]
    async fn reader_channel_closes_on_protocol_error() {
        let (near, far) = duplex(64);
        let mut frames = spawn_reader(far, codec::DEFAULT_MAX_FRAME_LEN);

        let mut near = near;
        // Valid frame followed by a garbage type byte.
        near.write_all(&[0, 0, 0, 1, 1, b'a']).await.unwrap();
        near.write_all(&[0, 0, 0, 0, 9]).await.unwrap();

        assert_eq!(
            frames.recv().await.unwrap(),
            Frame::response(Bytes::from_static(b"a"))
        );
        assert!(frames.recv().await.is_none());
    }
}
