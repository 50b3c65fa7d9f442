use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use codegate_proxy::ca::CertificateAuthority;
use codegate_proxy::config::{Cli, ProxyConfig};
use codegate_proxy::connection::{handle_connection, AppContext};
use codegate_proxy::control;
use codegate_proxy::error::CodegateError;
use codegate_proxy::metrics::ProxyMetrics;
use codegate_proxy::pipeline::pii::RegexPiiAnalyzer;
use codegate_proxy::pipeline::pii::RedactingStep;
use codegate_proxy::pipeline::suspicious::{NoopClassifier, NoopEmbedder, SuspiciousCodeStep};
use codegate_proxy::pipeline::{Pipeline, Step};
use codegate_proxy::routes::RouteTable;
use codegate_proxy::session::SessionStore;
use codegate_proxy::streaming::{OutputStep, PiiUnredactionStep, RedactionNotifierStep};
use codegate_proxy::tls;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ProxyConfig::from_env().map(|c| c.apply_cli(&cli)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&config);

    if cli.regenerate_ca {
        return match CertificateAuthority::load_or_generate(&config.ca_cert_path(), &config.ca_key_path(), true) {
            Ok(_) => {
                info!("certificate authority root regenerated");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %err, "failed to regenerate certificate authority");
                ExitCode::from(1)
            }
        };
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ (CodegateError::ConfigInvalid(_) | CodegateError::CaUnavailable(_))) => {
            error!(error = %err, "fatal startup error");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(error = %err, "unhandled fatal error");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(config: &ProxyConfig) {
    use codegate_proxy::config::LogFormat;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

async fn run(config: ProxyConfig) -> Result<(), CodegateError> {
    let ca = Arc::new(CertificateAuthority::load_or_generate(
        &config.ca_cert_path(),
        &config.ca_key_path(),
        config.force_certs,
    )?);

    let client_tls = tls::build_client_config(config.verify_upstream_certs)?;
    let routes = Arc::new(RouteTable::from_provider_base_urls(&config.provider_base_urls)?);
    let sessions = SessionStore::new(SESSION_IDLE_TIMEOUT);
    let metrics = Arc::new(ProxyMetrics::new()?);

    let analyzer: Arc<dyn codegate_proxy::pipeline::pii::PiiAnalyzer> = Arc::new(RegexPiiAnalyzer::new());
    let redacting_step: Arc<dyn Step> = Arc::new(RedactingStep::new(analyzer));
    let suspicious_step: Arc<dyn Step> = Arc::new(SuspiciousCodeStep::new(Arc::new(NoopEmbedder), Arc::new(NoopClassifier)));
    let input_pipeline = Arc::new(Pipeline::new(vec![redacting_step.clone(), suspicious_step]));
    let fim_pipeline = Arc::new(Pipeline::new(vec![redacting_step]));

    let output_steps: Vec<Arc<dyn OutputStep>> = vec![Arc::new(PiiUnredactionStep), Arc::new(RedactionNotifierStep)];

    let app = Arc::new(AppContext {
        ca,
        client_tls,
        routes,
        sessions: sessions.clone(),
        metrics: metrics.clone(),
        input_pipeline,
        fim_pipeline,
        output_steps,
        request_id_header: codegate_proxy::pipeline::DEFAULT_REQUEST_ID_HEADER.to_string(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_sessions = sessions.clone();
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => sweep_sessions.sweep_expired(),
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    let control_addr = format!("{}:{}", config.listen_host, config.control_port)
        .parse()
        .map_err(|e| CodegateError::ConfigInvalid(format!("invalid control listen address: {e}")))?;
    let control_metrics = metrics.clone();
    let control_cert = config.server_cert_path();
    let control_key = config.server_key_path();
    let control_shutdown = shutdown_rx.clone();
    let control_task = tokio::spawn(async move {
        if let Err(err) = control::serve(control_addr, control_metrics, &control_cert, &control_key, control_shutdown).await {
            error!(error = %err, "control listener exited with an error");
        }
    });

    let proxy_addr = format!("{}:{}", config.listen_host, config.proxy_port)
        .parse::<std::net::SocketAddr>()
        .map_err(|e| CodegateError::ConfigInvalid(format!("invalid proxy listen address: {e}")))?;
    let listener = TcpListener::bind(proxy_addr).await.map_err(CodegateError::Io)?;
    info!(%proxy_addr, "proxy listener ready");

    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let app = app.clone();
                in_flight.spawn(async move {
                    handle_connection(stream, peer_addr, app).await;
                });
            }
            _ = wait_for_shutdown_signal() => {
                info!("shutdown signal received, closing the accept loop");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    let drain = async {
        while in_flight.join_next().await.is_some() {}
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!("shutdown grace period elapsed with connections still in flight");
        in_flight.abort_all();
    }

    let _ = sweep_task.await;
    let _ = control_task.await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
