//! Control-plane listener: `/metrics` and `/healthz` over plain HTTP/1.1.
//!
//! Kept deliberately separate from the MITM proxy listener in
//! `connection.rs` — this one speaks to Prometheus and liveness probes,
//! never to a code assistant, and never terminates TLS for an intercepted
//! connection. A server certificate under the configured certs directory
//! is optional; when both files are present the listener serves over TLS
//! instead of plaintext.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::CodegateError;
use crate::metrics::ProxyMetrics;

const READ_LIMIT: usize = 8 * 1024;

/// Loads a TLS server config from a cert/key pair, if both files exist.
/// Returns `None` (plaintext mode) when either is missing.
fn load_listener_tls(cert_path: &Path, key_path: &Path) -> Result<Option<Arc<ServerConfig>>, CodegateError> {
    if !cert_path.exists() || !key_path.exists() {
        return Ok(None);
    }

    let cert_bytes = std::fs::read(cert_path).map_err(CodegateError::Io)?;
    let key_bytes = std::fs::read(key_path).map_err(CodegateError::Io)?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .map_err(CodegateError::Io)?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(CodegateError::Io)?
        .ok_or_else(|| CodegateError::ConfigInvalid("control listener key file has no private key".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(CodegateError::Tls)?;
    Ok(Some(Arc::new(config)))
}

/// Runs the control listener until `shutdown` resolves.
pub async fn serve(
    bind_addr: std::net::SocketAddr,
    metrics: Arc<ProxyMetrics>,
    tls_cert_path: &Path,
    tls_key_path: &Path,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), CodegateError> {
    let tls_config = load_listener_tls(tls_cert_path, tls_key_path)?;
    let listener = TcpListener::bind(bind_addr).await.map_err(CodegateError::Io)?;
    info!(%bind_addr, tls = tls_config.is_some(), "control listener ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "control listener accept failed");
                        continue;
                    }
                };
                let metrics = metrics.clone();
                let tls_config = tls_config.clone();
                tokio::spawn(async move {
                    let result = if let Some(config) = tls_config {
                        let acceptor = TlsAcceptor::from(config);
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_one(tls_stream, &metrics).await,
                            Err(err) => Err(CodegateError::Io(err)),
                        }
                    } else {
                        serve_one(stream, &metrics).await
                    };
                    if let Err(err) = result {
                        debug!(%peer, error = %err, "control request failed");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("control listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_one<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, metrics: &ProxyMetrics) -> Result<(), CodegateError> {
    let mut buf = vec![0u8; READ_LIMIT];
    let n = stream.read(&mut buf).await.map_err(CodegateError::Io)?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, content_type, body) = route(path, metrics)?;
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.map_err(CodegateError::Io)?;
    stream.write_all(&body).await.map_err(CodegateError::Io)?;
    Ok(())
}

fn route(path: &str, metrics: &ProxyMetrics) -> Result<(&'static str, &'static str, Vec<u8>), CodegateError> {
    match path {
        "/metrics" => Ok(("200 OK", "text/plain; version=0.0.4", metrics.render()?)),
        "/healthz" => Ok(("200 OK", "application/json", br#"{"status":"ok"}"#.to_vec())),
        _ => Ok(("404 Not Found", "text/plain", b"not found".to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_path_renders_prometheus_text() {
        let metrics = ProxyMetrics::new().unwrap();
        let (status, content_type, body) = route("/metrics", &metrics).unwrap();
        assert_eq!(status, "200 OK");
        assert_eq!(content_type, "text/plain; version=0.0.4");
        assert!(String::from_utf8(body).unwrap().contains("codegate_"));
    }

    #[test]
    fn healthz_path_returns_ok_json() {
        let metrics = ProxyMetrics::new().unwrap();
        let (status, _, body) = route("/healthz", &metrics).unwrap();
        assert_eq!(status, "200 OK");
        assert_eq!(body, br#"{"status":"ok"}"#);
    }

    #[test]
    fn unknown_path_is_404() {
        let metrics = ProxyMetrics::new().unwrap();
        let (status, _, _) = route("/nope", &metrics).unwrap();
        assert_eq!(status, "404 Not Found");
    }
}
