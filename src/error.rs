// ABOUTME: Error taxonomy shared by both proxy nodes
// ABOUTME: Every variant is handled at the link boundary; none crashes the process

use crate::codec::CodecError;
use std::io;
use thiserror::Error;

/// Errors produced by the ship and offshore nodes.
///
/// Everything here is recoverable at the link boundary: protocol errors tear
/// down the offending link, transaction-level errors become synthesized HTTP
/// responses (502 for the upstream chain, 500 for offshore parse failures,
/// 400 for malformed client input). The wire carries no error frames.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed frame header, impossible length, or decoder misuse.
    /// Fatal to the link that produced it.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// The peer disconnected. Fails all pending sends and the in-flight
    /// transaction; the ship reconnects, the offshore drops the dispatcher.
    #[error("link closed")]
    LinkClosed,

    /// A transaction could not complete within its bounded timeout, usually
    /// because the link is down and the request sat queued.
    #[error("offshore link unavailable: transaction timed out")]
    UpstreamUnavailable,

    /// Embedded HTTP could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Origin fetch failed (DNS, connect, TLS, read, CONNECT target refused).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Malformed client input on the ship's HTTP server.
    #[error("bad request: {0}")]
    Client(String),

    /// Invalid or missing environment configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;
