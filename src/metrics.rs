//! Prometheus metrics for the proxy.
//!
//! One [`ProxyMetrics`] is built once at startup and shared behind an
//! `Arc`. The control listener's `/metrics` endpoint renders it with
//! [`ProxyMetrics::render`]; every other module only ever touches the
//! typed counters/gauges/histograms, never the registry directly.

use prometheus::{Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

use crate::error::CodegateError;

#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    requests_total: CounterVec,
    connections_active: Gauge,
    tls_handshakes_total: CounterVec,
    cert_cache_hits_total: Counter,
    cert_cache_misses_total: Counter,
    pii_redactions_total: Counter,
    pipeline_step_duration_seconds: HistogramVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, CodegateError> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("codegate_requests_total", "Total proxied requests"),
            &["method", "status"],
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(requests_total.clone())).map_err(metrics_error)?;

        let connections_active = Gauge::new(
            "codegate_connections_active",
            "Number of client connections currently being served",
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(connections_active.clone())).map_err(metrics_error)?;

        let tls_handshakes_total = CounterVec::new(
            Opts::new("codegate_tls_handshakes_total", "Total client-facing TLS handshakes"),
            &["result"],
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(tls_handshakes_total.clone())).map_err(metrics_error)?;

        let cert_cache_hits_total = Counter::new(
            "codegate_cert_cache_hits_total",
            "Leaf certificates served from cache",
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(cert_cache_hits_total.clone())).map_err(metrics_error)?;

        let cert_cache_misses_total = Counter::new(
            "codegate_cert_cache_misses_total",
            "Leaf certificates minted fresh",
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(cert_cache_misses_total.clone())).map_err(metrics_error)?;

        let pii_redactions_total = Counter::new(
            "codegate_pii_redactions_total",
            "Total individual PII values redacted across all requests",
        )
        .map_err(metrics_error)?;
        registry.register(Box::new(pii_redactions_total.clone())).map_err(metrics_error)?;

        let pipeline_step_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "codegate_pipeline_step_duration_seconds",
                "Time spent inside a single pipeline step",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["step"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(pipeline_step_duration_seconds.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            requests_total,
            connections_active,
            tls_handshakes_total,
            cert_cache_hits_total,
            cert_cache_misses_total,
            pii_redactions_total,
            pipeline_step_duration_seconds,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn request_completed(&self, method: &str, status: u16) {
        self.requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
    }

    pub fn tls_handshake(&self, succeeded: bool) {
        let result = if succeeded { "ok" } else { "failed" };
        self.tls_handshakes_total.with_label_values(&[result]).inc();
    }

    pub fn cert_cache_hit(&self) {
        self.cert_cache_hits_total.inc();
    }

    pub fn cert_cache_miss(&self) {
        self.cert_cache_misses_total.inc();
    }

    pub fn pii_redactions(&self, count: usize) {
        self.pii_redactions_total.inc_by(count as f64);
    }

    pub fn observe_step_duration(&self, step: &str, seconds: f64) {
        self.pipeline_step_duration_seconds.with_label_values(&[step]).observe(seconds);
    }

    /// Renders every registered metric in Prometheus text exposition format.
    pub fn render(&self) -> Result<Vec<u8>, CodegateError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).map_err(metrics_error)?;
        Ok(buffer)
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new().expect("registering the built-in metric set must succeed")
    }
}

fn metrics_error(err: impl std::fmt::Display) -> CodegateError {
    CodegateError::ConfigInvalid(format!("metrics registry error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prometheus_text_with_registered_metric_names() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.request_completed("POST", 200);
        metrics.tls_handshake(true);
        metrics.pii_redactions(3);
        metrics.observe_step_duration("redacting_step", 0.01);

        let rendered = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(rendered.contains("codegate_requests_total"));
        assert!(rendered.contains("codegate_pii_redactions_total"));
        assert!(rendered.contains("codegate_pipeline_step_duration_seconds"));
    }

    #[test]
    fn connection_gauge_tracks_open_and_close() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        let rendered = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(rendered.contains("codegate_connections_active 1"));
    }
}
