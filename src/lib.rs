//! Two-node HTTP/HTTPS forward proxy over a single framed TCP link.
//!
//! The **ship** node accepts ordinary forward-proxy traffic (absolute-URI
//! requests and CONNECT) from local clients and carries every transaction
//! over exactly one long-lived TCP connection to the **offshore** node,
//! which performs the real origin fetches. The link between the two is
//! expensive and unreliable, so the design revolves around three things:
//!
//! * a length-prefixed framing protocol ([`codec`]) that multiplexes
//!   message blobs over the shared byte stream with exact boundary
//!   recovery,
//! * a strict FIFO transaction scheduler on the ship ([`ship::scheduler`])
//!   that keeps at most one request in flight, so responses correlate
//!   positionally with requests,
//! * a tunnel mode switch for CONNECT, in which the same framed link
//!   degrades to transparent byte forwarding in both directions and then
//!   restores message mode on teardown.
//!
//! The [`link`] module provides the per-link plumbing shared by both
//! nodes: a serialized frame sender (one write in flight, ever) and a
//! decoder-driven reader.

pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod link;
pub mod offshore;
pub mod ship;


pub use codec::{Frame, FrameDecoder, FrameType};
pub use error::{ProxyError, Result};
pub use link::FrameSender;
