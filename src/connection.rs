//! Per-connection state machine.
//!
//! Each accepted socket gets one task. The states below are spelled out
//! explicitly and logged at every transition rather than living only in
//! the control flow of nested callbacks, so a connection's progress is
//! visible from the logs alone.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::ca::CertificateAuthority;
use crate::error::CodegateError;
use crate::metrics::ProxyMetrics;
use crate::pipeline::{fim, select_pipeline, Pipeline, PipelineContext, PipelineKind};
use crate::routes::{self, RouteTable};
use crate::session::SessionStore;
use crate::streaming::{OutputStep, StreamRewriter};
use crate::wire::{self, ParseOutcome, RequestHead};

const PROXY_AGENT: &str = "CodeGate-Proxy";
const READ_CHUNK: usize = 8 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";
const SESSION_ID_HEADER: &str = "x-session-id";

#[derive(Debug, Clone, Copy)]
enum ConnectionState {
    ReadHeaders,
    Dispatch,
    ConnectSetup,
    ForwardPlain,
    Relay,
    Close,
}

/// Everything a connection task needs, built once at startup and shared
/// behind `Arc` — the explicit dependency root the design notes ask for
/// in place of global singletons.
pub struct AppContext {
    pub ca: Arc<CertificateAuthority>,
    pub client_tls: Arc<ClientConfig>,
    pub routes: Arc<RouteTable>,
    pub sessions: Arc<SessionStore>,
    pub metrics: Arc<ProxyMetrics>,
    pub input_pipeline: Arc<Pipeline>,
    pub fim_pipeline: Arc<Pipeline>,
    pub output_steps: Vec<Arc<dyn OutputStep>>,
    pub request_id_header: String,
}

pub async fn handle_connection(mut client: TcpStream, peer_addr: SocketAddr, app: Arc<AppContext>) {
    app.metrics.connection_opened();
    let mut state = ConnectionState::ReadHeaders;
    let mut buf = Vec::new();

    let head = match read_head(&mut client, &mut buf).await {
        Ok(head) => head,
        Err(err) => {
            debug!(%peer_addr, error = %err, "failed to read request head");
            write_error_reply(&mut client, &err).await;
            app.metrics.connection_closed();
            return;
        }
    };

    state = ConnectionState::Dispatch;
    debug!(?state, %peer_addr, method = %head.method, target = %head.target, "dispatching");

    let result = if head.is_connect() {
        state = ConnectionState::ConnectSetup;
        debug!(?state, %peer_addr);
        handle_connect(client, head, buf, &app).await
    } else {
        state = ConnectionState::ForwardPlain;
        debug!(?state, %peer_addr);
        handle_plain(&mut client, head, buf, &app).await.map_err(|err| {
            let _ = &err;
            err
        })
    };

    if let Err(err) = result {
        warn!(%peer_addr, error = %err, "connection ended with an error");
    }

    state = ConnectionState::Close;
    debug!(?state, %peer_addr, "connection closed");
    app.metrics.connection_closed();
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Result<RequestHead, CodegateError> {
    loop {
        match wire::parse_request_head(buf)? {
            ParseOutcome::Complete { head, consumed } => {
                buf.drain(..consumed);
                return Ok(head);
            }
            ParseOutcome::Incomplete => {
                let mut chunk = [0u8; READ_CHUNK];
                let n = stream.read(&mut chunk).await.map_err(CodegateError::Io)?;
                if n == 0 {
                    return Err(CodegateError::ClientProtocolError(
                        "connection closed before the request head completed".into(),
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

async fn read_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    content_length: usize,
) -> Result<Vec<u8>, CodegateError> {
    let mut body = Vec::with_capacity(content_length);
    while body.len() < content_length {
        if !buf.is_empty() {
            let take = buf.len().min(content_length - body.len());
            body.extend(buf.drain(..take));
            continue;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await.map_err(CodegateError::Io)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}

async fn write_error_reply<S: AsyncWrite + Unpin>(stream: &mut S, err: &CodegateError) {
    let (status, reason) = err.status();
    let body = err.to_string();
    let reply = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(reply.as_bytes()).await;
}

fn hop_by_hop_headers() -> HashSet<&'static str> {
    [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "host",
        "content-length",
    ]
    .into_iter()
    .collect()
}

fn pipeline_context_for(head: &RequestHead, request_id_header: &str) -> PipelineContext {
    let request_id = head
        .header(request_id_header)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let session_id = head
        .header(SESSION_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| request_id.clone());
    PipelineContext::new(request_id, session_id)
}

/// Writes a request line + header block (minus hop-by-hop headers and
/// `Host`, which is always replaced) to `out`, followed by `body`.
async fn write_forwarded_request<W: AsyncWrite + Unpin>(
    out: &mut W,
    head: &RequestHead,
    target_path: &str,
    host_header: &str,
    body: &[u8],
) -> Result<(), CodegateError> {
    let hop = hop_by_hop_headers();
    let mut message = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", head.method, target_path, host_header);
    for (name, value) in &head.headers {
        if hop.contains(name.to_ascii_lowercase().as_str()) {
            continue;
        }
        message.push_str(name);
        message.push_str(": ");
        message.push_str(value);
        message.push_str("\r\n");
    }
    message.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    out.write_all(message.as_bytes()).await.map_err(CodegateError::Io)?;
    out.write_all(body).await.map_err(CodegateError::Io)?;
    Ok(())
}

/// Reads an upstream response's status line and headers, returning any
/// body bytes that arrived in the same read as the tail end of the head.
/// The body itself is read separately, by whichever framing
/// [`body_framing_for`] reports, so a streamed body can be relayed as it
/// arrives instead of being buffered whole.
async fn read_response_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<(String, RequestHead, Vec<u8>), CodegateError> {
    let mut buf = Vec::new();
    loop {
        if let Some(head_end) = find_double_crlf(&buf) {
            let raw = &buf[..head_end];
            let text = std::str::from_utf8(raw)
                .map_err(|_| CodegateError::UpstreamUnavailable("non-UTF8 response head".into()))?;
            let mut lines = text.split("\r\n");
            let status_line = lines
                .next()
                .ok_or_else(|| CodegateError::UpstreamUnavailable("empty response".into()))?
                .to_string();
            let mut headers = Vec::new();
            for line in lines {
                if let Some((name, value)) = line.split_once(':') {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
            }
            let head = RequestHead {
                method: String::new(),
                target: String::new(),
                version: String::new(),
                headers,
            };
            let consumed = head_end + 4;
            let leftover = buf[consumed..].to_vec();
            return Ok((status_line, head, leftover));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await.map_err(CodegateError::Io)?;
        if n == 0 {
            return Err(CodegateError::UpstreamUnavailable(
                "upstream closed before sending a response head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// How the response body's end is signaled, per RFC 7230 §3.3.3: an
/// explicit length, `Transfer-Encoding: chunked` framing, or (for SSE
/// token streams, which carry neither) read-until-close.
enum BodyFraming {
    Length(usize),
    Chunked,
    UntilClose,
}

fn body_framing_for(head: &RequestHead) -> BodyFraming {
    if let Some(len) = head.content_length() {
        BodyFraming::Length(len)
    } else if head.is_chunked() {
        BodyFraming::Chunked
    } else {
        BodyFraming::UntilClose
    }
}

/// Reads the complete response body per `framing`, dechunking
/// `Transfer-Encoding: chunked` along the way. Used for responses handled
/// as a single JSON value (non-streamed pipeline bodies, and the raw
/// passthrough path, which needs the whole body to recompute
/// `Content-Length`).
async fn read_full_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    leftover: Vec<u8>,
    framing: &BodyFraming,
) -> Result<Vec<u8>, CodegateError> {
    match framing {
        BodyFraming::Length(len) => {
            let mut body = leftover;
            while body.len() < *len {
                let mut chunk = [0u8; READ_CHUNK];
                let n = stream.read(&mut chunk).await.map_err(CodegateError::Io)?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body.truncate(*len);
            Ok(body)
        }
        BodyFraming::UntilClose => {
            let mut body = leftover;
            loop {
                let mut chunk = [0u8; READ_CHUNK];
                let n = stream.read(&mut chunk).await.map_err(CodegateError::Io)?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
            Ok(body)
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new(leftover);
            let mut body = Vec::new();
            while let Some(piece) = decoder.next_chunk(stream).await? {
                body.extend_from_slice(&piece);
            }
            Ok(body)
        }
    }
}

/// Incrementally decodes an RFC 7230 §4.1 chunked body, reading from the
/// upstream stream only as far as each chunk demands so a caller can relay
/// decoded bytes to the client before the next chunk has even arrived.
struct ChunkedDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl ChunkedDecoder {
    fn new(leftover: Vec<u8>) -> Self {
        Self { buf: leftover, done: false }
    }

    /// Returns the next chunk's decoded payload, or `None` once the
    /// terminating zero-length chunk has been consumed.
    async fn next_chunk<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> Result<Option<Vec<u8>>, CodegateError> {
        if self.done {
            return Ok(None);
        }
        loop {
            let Some(line_end) = find_crlf(&self.buf) else {
                if !self.fill(stream).await? {
                    return Err(CodegateError::UpstreamUnavailable(
                        "upstream closed mid chunk-size line".into(),
                    ));
                }
                continue;
            };

            let size_line = std::str::from_utf8(&self.buf[..line_end])
                .map_err(|_| CodegateError::UpstreamUnavailable("invalid chunk-size line".into()))?;
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| CodegateError::UpstreamUnavailable(format!("invalid chunk size {size_line:?}")))?;

            let data_start = line_end + 2;
            if size == 0 {
                self.done = true;
                self.buf.clear();
                return Ok(None);
            }

            let data_end = data_start + size;
            while self.buf.len() < data_end + 2 {
                if !self.fill(stream).await? {
                    return Err(CodegateError::UpstreamUnavailable("upstream closed mid chunk".into()));
                }
            }
            let data = self.buf[data_start..data_end].to_vec();
            self.buf.drain(..data_end + 2);
            return Ok(Some(data));
        }
    }

    /// Reads more bytes from `stream` into the internal buffer. Returns
    /// `false` on EOF.
    async fn fill<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> Result<bool, CodegateError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await.map_err(CodegateError::Io)?;
        if n == 0 {
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }
}

/// Relays a streamed response body to the client chunk-by-chunk: each
/// piece read from upstream (dechunked if needed) is fed straight into the
/// rewriter and the framed result is written to the client immediately,
/// rather than waiting for the whole body to arrive.
async fn relay_streaming_body<S: AsyncRead + Unpin, C: AsyncWrite + Unpin>(
    upstream: &mut S,
    leftover: Vec<u8>,
    framing: BodyFraming,
    client: &mut C,
    rewriter: &mut StreamRewriter,
    context: &PipelineContext,
    sessions: &SessionStore,
) -> Result<(), CodegateError> {
    match framing {
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new(leftover);
            while let Some(piece) = decoder.next_chunk(upstream).await? {
                write_rewritten_piece(&piece, client, rewriter, context, sessions).await?;
            }
        }
        BodyFraming::Length(len) => {
            let mut remaining = len.saturating_sub(leftover.len());
            if !leftover.is_empty() {
                write_rewritten_piece(&leftover, client, rewriter, context, sessions).await?;
            }
            while remaining > 0 {
                let mut chunk = [0u8; READ_CHUNK];
                let n = upstream.read(&mut chunk).await.map_err(CodegateError::Io)?;
                if n == 0 {
                    break;
                }
                let n = n.min(remaining);
                write_rewritten_piece(&chunk[..n], client, rewriter, context, sessions).await?;
                remaining -= n;
            }
        }
        BodyFraming::UntilClose => {
            if !leftover.is_empty() {
                write_rewritten_piece(&leftover, client, rewriter, context, sessions).await?;
            }
            loop {
                let mut chunk = [0u8; READ_CHUNK];
                let n = upstream.read(&mut chunk).await.map_err(CodegateError::Io)?;
                if n == 0 {
                    break;
                }
                write_rewritten_piece(&chunk[..n], client, rewriter, context, sessions).await?;
            }
        }
    }
    write_chunked_trailer(client).await
}

async fn write_rewritten_piece<C: AsyncWrite + Unpin>(
    piece: &[u8],
    client: &mut C,
    rewriter: &mut StreamRewriter,
    context: &PipelineContext,
    sessions: &SessionStore,
) -> Result<(), CodegateError> {
    let framed = rewriter.process_upstream_chunk(piece, context, sessions).await;
    if framed.is_empty() {
        return Ok(());
    }
    write_chunk(client, &framed).await
}

/// Writes `data` as one `Transfer-Encoding: chunked` chunk to the client;
/// the rewritten SSE/JSON framing travels as the chunk's payload.
async fn write_chunk<C: AsyncWrite + Unpin>(client: &mut C, data: &[u8]) -> Result<(), CodegateError> {
    client
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await
        .map_err(CodegateError::Io)?;
    client.write_all(data).await.map_err(CodegateError::Io)?;
    client.write_all(b"\r\n").await.map_err(CodegateError::Io)
}

async fn write_chunked_trailer<C: AsyncWrite + Unpin>(client: &mut C) -> Result<(), CodegateError> {
    client.write_all(b"0\r\n\r\n").await.map_err(CodegateError::Io)
}

async fn run_request_pipeline(
    kind: PipelineKind,
    head: &RequestHead,
    body: Vec<u8>,
    app: &AppContext,
) -> (Vec<u8>, PipelineContext, Option<Value>) {
    let context = pipeline_context_for(head, &app.request_id_header);
    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let (pipeline, normalized) = match kind {
        PipelineKind::Fim => (&app.fim_pipeline, fim::normalize(&parsed)),
        PipelineKind::Input => (&app.input_pipeline, parsed.clone()),
    };

    let (processed, context, shortcircuit) = pipeline.run(normalized, context, &app.sessions).await;
    if let Some(response) = shortcircuit {
        return (body, context, Some(response));
    }

    let final_request = match kind {
        PipelineKind::Fim => fim::denormalize(&parsed, &processed),
        PipelineKind::Input => processed,
    };
    let rewritten = serde_json::to_vec(&final_request).unwrap_or(body);
    (rewritten, context, None)
}

/// `FORWARD_PLAIN`: a cleartext request arriving directly at the proxy
/// (not inside a `CONNECT` tunnel). Resolved against the route table or
/// a `proxy-ep=` override, then forwarded and relayed once.
async fn handle_plain(
    client: &mut TcpStream,
    head: RequestHead,
    mut buf: Vec<u8>,
    app: &AppContext,
) -> Result<(), CodegateError> {
    let content_length = head.content_length().unwrap_or(0);
    let body = read_body(client, &mut buf, content_length).await?;

    let override_url = head
        .header("authorization")
        .and_then(routes::extract_proxy_ep);
    let target_url = override_url
        .or_else(|| app.routes.resolve(&head.target))
        .ok_or_else(|| CodegateError::RouteMiss(head.target.clone()))?;

    let host = target_url.host_str().unwrap_or_default().to_string();
    let port = target_url
        .port_or_known_default()
        .unwrap_or(if target_url.scheme() == "https" { 443 } else { 80 });
    let path = if target_url.path().is_empty() { "/" } else { target_url.path() };

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| CodegateError::UpstreamUnavailable(e.to_string()))?;

    if target_url.scheme() == "https" {
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| CodegateError::UpstreamUnavailable(format!("invalid server name {host:?}")))?;
        let connector = TlsConnector::from(app.client_tls.clone());
        let mut upstream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| CodegateError::UpstreamUnavailable(e.to_string()))?;
        forward_and_relay(client, &mut upstream, &head, path, &host, body, app).await
    } else {
        let mut upstream = tcp;
        forward_and_relay(client, &mut upstream, &head, path, &host, body, app).await
    }
}

async fn forward_and_relay<U: AsyncRead + AsyncWrite + Unpin, C: AsyncRead + AsyncWrite + Unpin>(
    client: &mut C,
    upstream: &mut U,
    head: &RequestHead,
    target_path: &str,
    host_header: &str,
    body: Vec<u8>,
    app: &AppContext,
) -> Result<(), CodegateError> {
    let user_agent = head.header("user-agent");
    let pipeline_kind = select_pipeline(&head.method, &head.target, user_agent);

    match pipeline_kind {
        None => {
            write_forwarded_request(upstream, head, target_path, host_header, &body).await?;
            let (status, resp_head, leftover) = read_response_head(upstream).await?;
            let framing = body_framing_for(&resp_head);
            let resp_body = read_full_body(upstream, leftover, &framing).await?;
            write_raw_response(client, &status, &resp_head, &resp_body).await
        }
        Some(kind) => {
            let (rewritten_body, context, shortcircuit) = run_request_pipeline(kind, head, body, app).await;
            if let Some(response) = shortcircuit {
                write_json_response(client, 200, &response).await?;
                return Ok(());
            }

            write_forwarded_request(upstream, head, target_path, host_header, &rewritten_body).await?;
            let (status, resp_head, leftover) = read_response_head(upstream).await?;
            let framing = body_framing_for(&resp_head);

            if app.output_steps.is_empty() {
                let resp_body = read_full_body(upstream, leftover, &framing).await?;
                return write_raw_response(client, &status, &resp_head, &resp_body).await;
            }

            let is_stream = resp_head
                .header("content-type")
                .map(|ct| ct.contains("text/event-stream"))
                .unwrap_or(false);

            if is_stream {
                let mut rewriter = StreamRewriter::new(app.output_steps.clone());
                write_status_and_headers(client, &status, &resp_head, ResponseBodyFraming::Chunked).await?;
                relay_streaming_body(upstream, leftover, framing, client, &mut rewriter, &context, &app.sessions).await
            } else {
                let mut rewriter = StreamRewriter::new(app.output_steps.clone());
                let resp_body = read_full_body(upstream, leftover, &framing).await?;
                let parsed: Value = serde_json::from_slice(&resp_body).unwrap_or(Value::Null);
                let rewritten = rewriter.process_single_body(parsed, &context, &app.sessions).await;
                let bytes = serde_json::to_vec(&rewritten).unwrap_or(resp_body);
                write_status_and_headers(client, &status, &resp_head, ResponseBodyFraming::Length(bytes.len())).await?;
                client.write_all(&bytes).await.map_err(CodegateError::Io)
            }
        }
    }
}

async fn write_raw_response<C: AsyncWrite + Unpin>(
    client: &mut C,
    status: &str,
    head: &RequestHead,
    body: &[u8],
) -> Result<(), CodegateError> {
    write_status_and_headers(client, status, head, ResponseBodyFraming::Length(body.len())).await?;
    client.write_all(body).await.map_err(CodegateError::Io)
}

/// How the response body being written to the client is framed: either a
/// known length, or `Transfer-Encoding: chunked` for a relayed stream whose
/// final size isn't known up front.
enum ResponseBodyFraming {
    Length(usize),
    Chunked,
}

async fn write_status_and_headers<C: AsyncWrite + Unpin>(
    client: &mut C,
    status: &str,
    head: &RequestHead,
    framing: ResponseBodyFraming,
) -> Result<(), CodegateError> {
    let hop = hop_by_hop_headers();
    let mut message = format!("{status}\r\n");
    for (name, value) in &head.headers {
        if hop.contains(name.to_ascii_lowercase().as_str()) {
            continue;
        }
        message.push_str(name);
        message.push_str(": ");
        message.push_str(value);
        message.push_str("\r\n");
    }
    match framing {
        ResponseBodyFraming::Length(len) => message.push_str(&format!("Content-Length: {len}\r\n")),
        ResponseBodyFraming::Chunked => message.push_str("Transfer-Encoding: chunked\r\n"),
    }
    message.push_str("\r\n");
    client.write_all(message.as_bytes()).await.map_err(CodegateError::Io)
}

async fn write_json_response<C: AsyncWrite + Unpin>(
    client: &mut C,
    status: u16,
    body: &Value,
) -> Result<(), CodegateError> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let message = format!(
        "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        bytes.len()
    );
    client.write_all(message.as_bytes()).await.map_err(CodegateError::Io)?;
    client.write_all(&bytes).await.map_err(CodegateError::Io)
}

/// `CONNECT_SETUP` → TLS upgrade → `RELAY` for the lifetime of the tunnel.
async fn handle_connect(
    mut client: TcpStream,
    head: RequestHead,
    leftover: Vec<u8>,
    app: &AppContext,
) -> Result<(), CodegateError> {
    let (host, port) = wire::parse_connect_target(&head.target)?;

    let leaf = app.ca.get_leaf(&host).await?;
    let server_config = crate::tls::server_config_for_leaf(&leaf)?;

    client
        .write_all(format!("HTTP/1.1 200 Connection Established\r\nProxy-Agent: {PROXY_AGENT}\r\n\r\n").as_bytes())
        .await
        .map_err(CodegateError::Io)?;

    let acceptor = TlsAcceptor::from(server_config);
    let tls_client = acceptor.accept(client).await.map_err(CodegateError::Io)?;
    app.metrics.tls_handshake(true);

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| CodegateError::UpstreamUnavailable(e.to_string()))?;
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| CodegateError::UpstreamUnavailable(format!("invalid server name {host:?}")))?;
    let connector = TlsConnector::from(app.client_tls.clone());
    let tls_upstream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| CodegateError::UpstreamUnavailable(e.to_string()))?;

    serve_tunnel(tls_client, tls_upstream, leftover, &host, app).await
}

async fn serve_tunnel<C, U>(
    mut client: C,
    mut upstream: U,
    leftover: Vec<u8>,
    tunnel_host: &str,
    app: &AppContext,
) -> Result<(), CodegateError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = leftover;
    loop {
        let head = match read_head(&mut client, &mut buf).await {
            Ok(head) => head,
            Err(_) => return Ok(()),
        };
        let content_length = head.content_length().unwrap_or(0);
        let body = read_body(&mut client, &mut buf, content_length).await?;

        forward_and_relay(&mut client, &mut upstream, &head, &head.target, tunnel_host, body, app).await?;

        if head
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
        {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_set_covers_the_usual_suspects() {
        let hop = hop_by_hop_headers();
        assert!(hop.contains("connection"));
        assert!(hop.contains("transfer-encoding"));
        assert!(!hop.contains("authorization"));
    }

    #[test]
    fn pipeline_context_falls_back_to_a_generated_request_id() {
        let head = RequestHead {
            method: "POST".into(),
            target: "/v1/chat/completions".into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        };
        let context = pipeline_context_for(&head, REQUEST_ID_HEADER);
        assert!(!context.request_id.is_empty());
    }

    #[test]
    fn pipeline_context_prefers_the_request_header() {
        let head = RequestHead {
            method: "POST".into(),
            target: "/v1/chat/completions".into(),
            version: "HTTP/1.1".into(),
            headers: vec![(REQUEST_ID_HEADER.to_string(), "abc-123".to_string())],
        };
        let context = pipeline_context_for(&head, REQUEST_ID_HEADER);
        assert_eq!(context.request_id, "abc-123");
    }

    #[test]
    fn body_framing_prefers_content_length_then_chunked_then_until_close() {
        let with_length = RequestHead {
            method: String::new(),
            target: String::new(),
            version: String::new(),
            headers: vec![("Content-Length".into(), "5".into())],
        };
        assert!(matches!(body_framing_for(&with_length), BodyFraming::Length(5)));

        let chunked = RequestHead {
            method: String::new(),
            target: String::new(),
            version: String::new(),
            headers: vec![("Transfer-Encoding".into(), "chunked".into())],
        };
        assert!(matches!(body_framing_for(&chunked), BodyFraming::Chunked));

        let bare = RequestHead {
            method: String::new(),
            target: String::new(),
            version: String::new(),
            headers: vec![],
        };
        assert!(matches!(body_framing_for(&bare), BodyFraming::UntilClose));
    }

    #[tokio::test]
    async fn chunked_decoder_yields_each_chunk_and_then_stops_at_the_terminator() {
        let (mut writer, mut reader) = tokio::io::duplex(128);
        writer.write_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").await.unwrap();
        drop(writer);

        let mut decoder = ChunkedDecoder::new(Vec::new());
        let first = decoder.next_chunk(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, b"hello");
        let second = decoder.next_chunk(&mut reader).await.unwrap().unwrap();
        assert_eq!(second, b" world");
        assert!(decoder.next_chunk(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunked_decoder_handles_a_chunk_split_across_reads() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        let decode = tokio::spawn(async move {
            let mut decoder = ChunkedDecoder::new(Vec::new());
            let mut body = Vec::new();
            while let Some(piece) = decoder.next_chunk(&mut reader).await.unwrap() {
                body.extend_from_slice(&piece);
            }
            body
        });

        writer.write_all(b"4\r\nab").await.unwrap();
        writer.write_all(b"cd\r\n0\r\n\r\n").await.unwrap();
        drop(writer);

        let body = decode.await.unwrap();
        assert_eq!(body, b"abcd");
    }
}
