//! Incremental HTTP/1.1 request-head parser.
//!
//! The proxy never hands the client socket to a library like hyper: the
//! wire format only needs to be understood far enough to route the request
//! and split off its body, and that is cheaper done by hand over the raw
//! byte buffer that accumulates from successive `read()` calls. Parsing is
//! incremental because a request line or header can arrive split across
//! TCP segments; callers keep feeding bytes in and re-parsing until
//! [`ParseOutcome::Complete`] comes back.

use crate::error::CodegateError;

/// Requests larger than this many header bytes are rejected with `413`
/// before the buffer grows any further.
pub const MAX_HEAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

pub enum ParseOutcome {
    /// Not enough bytes yet; keep reading.
    Incomplete,
    /// The head parsed cleanly; `consumed` is the byte offset of the body
    /// (or of the next pipelined request) within `buf`.
    Complete { head: RequestHead, consumed: usize },
}

/// Scans `buf` for a complete `\r\n\r\n`-terminated request head.
///
/// Returns [`CodegateError::BufferOverflow`] once `buf` exceeds
/// `MAX_HEAD_BYTES` without yet finding the terminator, and
/// [`CodegateError::ClientProtocolError`] for a head that is complete but
/// malformed (bad request line, header with no colon).
pub fn parse_request_head(buf: &[u8]) -> Result<ParseOutcome, CodegateError> {
    let Some(head_end) = find_double_crlf(buf) else {
        if buf.len() > MAX_HEAD_BYTES {
            return Err(CodegateError::BufferOverflow {
                limit: MAX_HEAD_BYTES,
            });
        }
        return Ok(ParseOutcome::Incomplete);
    };

    let raw = &buf[..head_end];
    let text = std::str::from_utf8(raw)
        .map_err(|_| CodegateError::ClientProtocolError("request head is not valid UTF-8".into()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| CodegateError::ClientProtocolError("missing request line".into()))?;

    let mut parts = request_line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodegateError::ClientProtocolError("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodegateError::ClientProtocolError("missing request target".into()))?
        .to_string();
    let version = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodegateError::ClientProtocolError("missing HTTP version".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodegateError::ClientProtocolError(format!("malformed header {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ParseOutcome::Complete {
        head: RequestHead {
            method,
            target,
            version,
            headers,
        },
        consumed: head_end + 4,
    })
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Splits a CONNECT target (`host:port`) into its parts. CONNECT requests
/// always carry an explicit port; bare IPv6 literals are accepted in their
/// bracketed form (`[::1]:443`).
pub fn parse_connect_target(target: &str) -> Result<(String, u16), CodegateError> {
    let bad = || CodegateError::ClientProtocolError(format!("invalid CONNECT target {target:?}"));

    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(bad)?;
        let port = rest.strip_prefix(':').ok_or_else(bad)?;
        let port: u16 = port.parse().map_err(|_| bad())?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = target.rsplit_once(':').ok_or_else(bad)?;
    let port: u16 = port.parse().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}
