// ABOUTME: HTTP/1.1 message handling shared by the ship and offshore nodes
// ABOUTME: Head parsing via httparse, whole-body buffering, canonical wire serialization

use crate::error::{ProxyError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt::Write as _;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on a request head read from a client socket.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Cap on a buffered request body. Bodies are held whole per transaction,
/// so this bounds per-transaction memory.
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

const MAX_HEADERS: usize = 100;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed request line and header block.
///
/// Header values are kept as strings (lossily decoded); HTTP/1.1 header
/// values are ASCII in practice and this matches what gets re-serialized
/// onto the link.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub minor_version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Declared body length. `None` when the request carries no
    /// `Content-Length`; an unparsable value is a client error.
    pub fn content_length(&self) -> Result<Option<usize>> {
        let Some(raw) = self.header("content-length") else {
            return Ok(None);
        };
        raw.trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ProxyError::Client(format!("invalid Content-Length: {raw:?}")))
    }

    /// Whether the client connection should close after this exchange.
    pub fn wants_close(&self) -> bool {
        match self.header("connection").or_else(|| self.header("proxy-connection")) {
            Some(v) => v.to_ascii_lowercase().contains("close"),
            None => self.minor_version == 0,
        }
    }
}

/// Read one request head from a client socket.
///
/// `buf` carries leftover bytes between calls on a keep-alive connection;
/// on return it has been advanced past the head, so it holds exactly the
/// bytes the client sent beyond it (body bytes, or for CONNECT the eagerly
/// sent tunnel prefix). Returns `None` on a clean EOF before any request
/// bytes.
pub async fn read_request_head<R>(read: &mut R, buf: &mut BytesMut) -> Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            let head = parse_request_head(&buf[..end])
                .map_err(|err| ProxyError::Client(err.to_string()))?;
            buf.advance(end);
            return Ok(Some(head));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(ProxyError::Client(format!(
                "request head exceeds {MAX_HEAD_LEN} bytes"
            )));
        }

        if read.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Client(
                "connection closed mid request head".into(),
            ));
        }
    }
}

/// Read a `Content-Length` body, consuming `buf` leftovers first.
pub async fn read_body<R>(read: &mut R, buf: &mut BytesMut, len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len > MAX_BODY_LEN {
        return Err(ProxyError::Client(format!(
            "request body of {len} bytes exceeds {MAX_BODY_LEN} byte cap"
        )));
    }
    while buf.len() < len {
        if read.read_buf(buf).await? == 0 {
            return Err(ProxyError::Client(
                "connection closed mid request body".into(),
            ));
        }
    }
    Ok(buf.split_to(len).freeze())
}

/// Parse a complete request blob (head + body) as carried in a REQUEST frame.
pub fn parse_request(payload: &[u8]) -> Result<(RequestHead, Bytes)> {
    let end = find_head_end(payload)
        .ok_or_else(|| ProxyError::Parse("request blob has no header terminator".into()))?;
    let head = parse_request_head(&payload[..end])?;
    Ok((head, Bytes::copy_from_slice(&payload[end..])))
}

fn parse_request_head(head: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::Parse("truncated request head".into()));
        }
        Err(err) => {
            return Err(ProxyError::Parse(format!("malformed request head: {err}")));
        }
    }

    let method = req
        .method
        .ok_or_else(|| ProxyError::Parse("missing request method".into()))?;
    let target = req
        .path
        .ok_or_else(|| ProxyError::Parse("missing request target".into()))?;
    let minor_version = req
        .version
        .ok_or_else(|| ProxyError::Parse("missing HTTP version".into()))?;

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        minor_version,
        headers: req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
    })
}

/// Re-serialize a request as a canonical HTTP/1.1 wire blob.
///
/// The request line is always written as HTTP/1.1 and `Content-Length` is
/// regenerated from the actual body so the frame payload is self-describing.
pub fn serialize_request(head: &RequestHead, body: &[u8]) -> Bytes {
    let mut out = String::with_capacity(256);
    let _ = write!(out, "{} {} HTTP/1.1\r\n", head.method, head.target);
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let _ = write!(out, "{name}: {value}\r\n");
    }
    if !body.is_empty() || head.header("content-length").is_some() {
        let _ = write!(out, "Content-Length: {}\r\n", body.len());
    }
    out.push_str("\r\n");

    let mut blob = BytesMut::with_capacity(out.len() + body.len());
    blob.extend_from_slice(out.as_bytes());
    blob.extend_from_slice(body);
    blob.freeze()
}

/// Status code of a complete response blob, validating its head on the way.
pub fn response_status(payload: &[u8]) -> Result<u16> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(payload) {
        Ok(httparse::Status::Complete(_)) => resp
            .code
            .ok_or_else(|| ProxyError::Parse("response missing status code".into())),
        Ok(httparse::Status::Partial) => {
            Err(ProxyError::Parse("truncated response head".into()))
        }
        Err(err) => Err(ProxyError::Parse(format!("malformed response head: {err}"))),
    }
}

/// Build a response blob from an origin fetch result.
///
/// Hop-by-hop headers and the origin's `Content-Length` are dropped; the
/// length is regenerated from the buffered body. `Transfer-Encoding` never
/// appears: the link carries framed, length-known blobs only.
pub fn build_response(
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Bytes {
    let mut out = String::with_capacity(256);
    let _ = write!(out, "HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let _ = write!(out, "{name}: {value}\r\n");
    }
    let _ = write!(out, "Content-Length: {}\r\n\r\n", body.len());

    let mut blob = BytesMut::with_capacity(out.len() + body.len());
    blob.extend_from_slice(out.as_bytes());
    blob.extend_from_slice(body);
    blob.freeze()
}

/// Synthesize an error response (502/500/400) with a plain-text body.
pub fn synthesize_response(status: u16, reason: &str, body: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    ))
}

/// Hop-by-hop headers, valid only for a single connection. Stripped before
/// forwarding a request to origin and before re-serializing a response.
pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

/// Resolve the origin URL for a non-CONNECT proxy request.
///
/// Absolute-form targets (`GET http://host/path`) are used as-is;
/// origin-form targets need a `Host` header to reconstruct the URL.
pub fn target_url(head: &RequestHead) -> Result<String> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return Ok(head.target.clone());
    }

    let host = head
        .header("host")
        .ok_or_else(|| ProxyError::Parse("origin-form request without Host header".into()))?;

    if head.target.starts_with('/') {
        Ok(format!("http://{host}{}", head.target))
    } else {
        Err(ProxyError::Parse(format!(
            "unsupported request target {:?}",
            head.target
        )))
    }
}

/// Normalize a CONNECT authority, defaulting the port to 443.
pub fn connect_authority(target: &str) -> String {
    match target.rfind(':') {
        // A colon inside an IPv6 literal ("[::1]") is not a port separator.
        Some(idx) if !target[idx..].contains(']') => target.to_string(),
        _ => format!("{target}:443"),
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(blob: &[u8]) -> RequestHead {
        let (head, _) = parse_request(blob).unwrap();
        head
    }

    #[test]
    fn parse_absolute_form_request() {
        let (head, body) =
            parse_request(b"GET http://example.com/a?b=c HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/a?b=c");
        assert_eq!(head.minor_version, 1);
        assert_eq!(head.header("host"), Some("example.com"));
        assert!(body.is_empty());
    }

    #[test]
    fn parse_request_with_body() {
        let (head, body) = parse_request(
            b"POST http://h/p HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nwxyz",
        )
        .unwrap();
        assert_eq!(head.content_length().unwrap(), Some(4));
        assert_eq!(body.as_ref(), b"wxyz");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_request(b"not http at all\r\n\r\n").is_err());
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: h\r\n").is_err());
    }

    #[test]
    fn serialize_fixes_content_length() {
        let head = head_of(b"POST http://h/ HTTP/1.1\r\nHost: h\r\nContent-Length: 99\r\n\r\n");
        let blob = serialize_request(&head, b"12345");
        let text = std::str::from_utf8(&blob).unwrap();
        assert!(text.starts_with("POST http://h/ HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("Content-Length: 99"));
        assert!(text.ends_with("\r\n\r\n12345"));
    }

    #[test]
    fn serialize_connect_has_no_body_or_length() {
        let head = head_of(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n");
        let blob = serialize_request(&head, b"");
        let text = std::str::from_utf8(&blob).unwrap();
        assert!(text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(!text.to_ascii_lowercase().contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_status_parses_and_validates() {
        assert_eq!(
            response_status(b"HTTP/1.1 200 Connection Established\r\n\r\n").unwrap(),
            200
        );
        assert_eq!(
            response_status(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n").unwrap(),
            502
        );
        assert!(response_status(b"garbage\r\n\r\n").is_err());
        assert!(response_status(b"HTTP/1.1 200 OK\r\n").is_err());
    }

    #[test]
    fn build_response_strips_hop_by_hop_and_rewrites_length() {
        let headers = vec![
            ("Content-Type".to_string(), "text/html".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Length".to_string(), "999".to_string()),
        ];
        let blob = build_response(200, "OK", &headers, b"hello");
        let text = std::str::from_utf8(&blob).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(!text.to_ascii_lowercase().contains("connection"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn synthesized_error_shape() {
        let blob = synthesize_response(502, "Bad Gateway", "dns lookup failed");
        let text = std::str::from_utf8(&blob).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("dns lookup failed"));
    }

    #[test]
    fn target_url_forms() {
        let head = head_of(b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(target_url(&head).unwrap(), "http://example.com/a");

        let head = head_of(b"GET /hello HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        assert_eq!(target_url(&head).unwrap(), "http://example.com:8080/hello");

        let head = head_of(b"GET /x HTTP/1.1\r\nAccept: */*\r\n\r\n");
        assert!(target_url(&head).is_err());
    }

    #[test]
    fn connect_authority_defaults_port() {
        assert_eq!(connect_authority("example.com:8443"), "example.com:8443");
        assert_eq!(connect_authority("example.com"), "example.com:443");
        assert_eq!(connect_authority("[::1]"), "[::1]:443");
        assert_eq!(connect_authority("[::1]:8080"), "[::1]:8080");
    }

    #[test]
    fn hop_by_hop_set() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("proxy-connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("host"));
    }

    #[test]
    fn wants_close_variants() {
        assert!(head_of(b"GET / HTTP/1.0\r\n\r\n").wants_close());
        assert!(!head_of(b"GET / HTTP/1.1\r\n\r\n").wants_close());
        assert!(head_of(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").wants_close());
        assert!(!head_of(b"GET / HTTP/1.1\r\nProxy-Connection: keep-alive\r\n\r\n").wants_close());
    }

    #[tokio::test]
    async fn read_head_and_body_from_socket() {
        let (mut near, far) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(
            &mut near,
            b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabcGET",
        )
        .await
        .unwrap();

        let mut far = far;
        let mut buf = BytesMut::new();
        let head = read_request_head(&mut far, &mut buf).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        let body = read_body(&mut far, &mut buf, 3).await.unwrap();
        assert_eq!(body.as_ref(), b"abc");
        // Pipelined leftovers stay buffered for the next head.
        assert_eq!(buf.as_ref(), b"GET");
    }

    #[tokio::test]
    async fn read_head_clean_eof_is_none() {
        let (near, mut far) = tokio::io::duplex(16);
        drop(near);
        let mut buf = BytesMut::new();
        assert!(
            read_request_head(&mut far, &mut buf)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn read_head_mid_eof_is_client_error() {
        let (mut near, mut far) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut near, b"GET / HTT")
            .await
            .unwrap();
        drop(near);
        let mut buf = BytesMut::new();
        let err = read_request_head(&mut far, &mut buf).await.unwrap_err();
        assert!(matches!(err, ProxyError::Client(_)));
    }
}
