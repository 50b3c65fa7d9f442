//! Error hierarchy
//!
//! Every error kind named in the proxy's design is represented here.
//! Startup-fatal kinds ([`CodegateError::ConfigInvalid`],
//! [`CodegateError::CaUnavailable`]) propagate out of `main`; the rest map
//! to an HTTP status via [`CodegateError::status`] and close (or keep open)
//! the client connection per policy.

#[derive(Debug, thiserror::Error)]
pub enum CodegateError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("certificate authority unavailable: {0}")]
    CaUnavailable(String),

    #[error("no route for path {0:?}")]
    RouteMiss(String),

    #[error("client protocol error: {0}")]
    ClientProtocolError(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("pipeline step {step:?} failed: {source}")]
    PipelineStepError {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("client buffer exceeded {limit} bytes")]
    BufferOverflow { limit: usize },

    #[error("session {0} expired or unknown")]
    SessionExpired(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

impl CodegateError {
    /// Maps a client-facing error to the `(status, reason)` pair the wire
    /// protocol replies with. Startup-fatal kinds have no meaningful status
    /// and are never passed here.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            CodegateError::RouteMiss(_) => (404, "Not Found"),
            CodegateError::ClientProtocolError(_) => (400, "Bad Request"),
            CodegateError::BufferOverflow { .. } => (413, "Request Entity Too Large"),
            CodegateError::UpstreamUnavailable(_) => (502, "Bad Gateway"),
            CodegateError::Io(_) => (502, "Bad Gateway"),
            CodegateError::Tls(_) => (502, "Bad Gateway"),
            CodegateError::SessionExpired(_) => (200, "OK"),
            CodegateError::PipelineStepError { .. } => (200, "OK"),
            CodegateError::ConfigInvalid(_) => (500, "Internal Server Error"),
            CodegateError::CaUnavailable(_) => (500, "Internal Server Error"),
        }
    }
}
