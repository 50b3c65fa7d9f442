//! Proxy configuration
//!
//! A single [`ProxyConfig`] record assembled once at startup from
//! environment variables (documented defaults below) and optional CLI
//! overrides, then threaded down to every component. Nothing in the
//! engine reaches back into the environment after `main` builds this.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use clap::Parser;

use crate::error::CodegateError;

const ENV_PREFIX_PROVIDER: &str = "CODEGATE_PROVIDER_";
const ENV_SUFFIX_URL: &str = "_URL";

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_host: String,
    pub control_port: u16,
    pub proxy_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub provider_base_urls: HashMap<String, String>,
    pub certs_dir: PathBuf,
    pub ca_cert_file: String,
    pub ca_key_file: String,
    pub server_cert_file: String,
    pub server_key_file: String,
    pub force_certs: bool,
    pub shutdown_grace: std::time::Duration,
    pub verify_upstream_certs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl ProxyConfig {
    /// Builds the config from the process environment, applying the
    /// defaults documented in the external-interfaces section of the spec.
    pub fn from_env() -> Result<Self, CodegateError> {
        let listen_host = env::var("CODEGATE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let control_port = parse_port("CODEGATE_CONTROL_PORT", 9090)?;
        let proxy_port = parse_port("CODEGATE_PROXY_PORT", 8989)?;
        let log_level = env::var("CODEGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = match env::var("CODEGATE_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("pretty") | Err(_) => LogFormat::Pretty,
            Ok(other) => {
                return Err(CodegateError::ConfigInvalid(format!(
                    "CODEGATE_LOG_FORMAT must be 'pretty' or 'json', got {other:?}"
                )));
            }
        };

        let mut provider_base_urls = HashMap::new();
        for (key, value) in env::vars() {
            if let Some(rest) = key.strip_prefix(ENV_PREFIX_PROVIDER) {
                if let Some(name) = rest.strip_suffix(ENV_SUFFIX_URL) {
                    provider_base_urls.insert(name.to_ascii_lowercase(), value);
                }
            }
        }

        let certs_dir = env::var("CODEGATE_CERTS_DIR")
            .unwrap_or_else(|_| "./codegate_certs".to_string())
            .into();
        let ca_cert_file = env::var("CODEGATE_CA_CERT_FILE").unwrap_or_else(|_| "ca.crt".into());
        let ca_key_file = env::var("CODEGATE_CA_KEY_FILE").unwrap_or_else(|_| "ca.key".into());
        let server_cert_file =
            env::var("CODEGATE_SERVER_CERT_FILE").unwrap_or_else(|_| "server.crt".into());
        let server_key_file =
            env::var("CODEGATE_SERVER_KEY_FILE").unwrap_or_else(|_| "server.key".into());
        let force_certs = parse_bool("CODEGATE_FORCE_CERTS", false)?;
        let shutdown_grace_secs = parse_u64("CODEGATE_SHUTDOWN_GRACE_SECS", 10)?;
        let verify_upstream_certs = parse_bool("CODEGATE_VERIFY_UPSTREAM_CERTS", false)?;

        Ok(Self {
            listen_host,
            control_port,
            proxy_port,
            log_level,
            log_format,
            provider_base_urls,
            certs_dir,
            ca_cert_file,
            ca_key_file,
            server_cert_file,
            server_key_file,
            force_certs,
            shutdown_grace: std::time::Duration::from_secs(shutdown_grace_secs),
            verify_upstream_certs,
        })
    }

    /// Applies CLI-supplied overrides on top of the environment-derived
    /// defaults. CLI flags always win when present.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(host) = &cli.host {
            self.listen_host = host.clone();
        }
        if let Some(port) = cli.proxy_port {
            self.proxy_port = port;
        }
        if let Some(port) = cli.control_port {
            self.control_port = port;
        }
        if let Some(dir) = &cli.certs_dir {
            self.certs_dir = dir.clone();
        }
        if cli.force_certs {
            self.force_certs = true;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        self
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.certs_dir.join(&self.ca_cert_file)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.certs_dir.join(&self.ca_key_file)
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.certs_dir.join(&self.server_cert_file)
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.certs_dir.join(&self.server_key_file)
    }
}

fn parse_port(var: &str, default: u16) -> Result<u16, CodegateError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| CodegateError::ConfigInvalid(format!("{var} must be a valid port, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(var: &str, default: bool) -> Result<bool, CodegateError> {
    match env::var(var) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(CodegateError::ConfigInvalid(format!(
                "{var} must be a boolean, got {raw:?}"
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn parse_u64(var: &str, default: u64) -> Result<u64, CodegateError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| CodegateError::ConfigInvalid(format!("{var} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// CLI overrides for the environment-derived configuration.
#[derive(Debug, Parser)]
#[command(name = "codegate-proxy", about = "TLS-intercepting forward proxy for AI code assistants")]
pub struct Cli {
    /// Listening host for both the proxy and control listeners.
    #[arg(long)]
    pub host: Option<String>,

    /// Port the MITM proxy listens on.
    #[arg(long = "proxy-port")]
    pub proxy_port: Option<u16>,

    /// Port the metrics/health control listener listens on.
    #[arg(long = "control-port")]
    pub control_port: Option<u16>,

    /// Directory holding the CA and server certificate/key files.
    #[arg(long = "certs-dir")]
    pub certs_dir: Option<PathBuf>,

    /// Regenerate the CA root even if one already exists on disk.
    #[arg(long = "force-certs", default_value_t = false)]
    pub force_certs: bool,

    /// Delete the CA root and every cached leaf, then exit.
    #[arg(long = "regenerate-ca", default_value_t = false)]
    pub regenerate_ca: bool,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}
