//! Certificate authority: root identity persistence and per-host leaf minting.
//!
//! A root is generated once and reused across restarts. Leaf certificates
//! are signed on demand, cached in memory, and re-minted once they drift
//! within a day of expiry. Concurrent callers minting the same host share
//! one signing operation through a per-host async lock instead of racing.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::CodegateError;

const LEAF_CACHE_CAPACITY: usize = 512;
const LEAF_VALIDITY_DAYS: i64 = 395;
const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_REFRESH_WINDOW: Duration = Duration::hours(24);

/// A signed leaf certificate plus the raw PKCS#8 key bytes behind it.
///
/// The key is kept as DER bytes rather than a `PrivateKeyDer` because the
/// latter has no `Clone`; [`TlsContextFactory`](crate::tls) needs an owned
/// copy per `ServerConfig` it builds from a cached leaf.
pub struct LeafCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key_der: Vec<u8>,
    pub not_after: OffsetDateTime,
}

impl LeafCert {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    ca_cert_pem: String,
    cache: StdMutex<LeafCache>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CertificateAuthority {
    /// Loads the root from `cert_path`/`key_path` if both exist, otherwise
    /// generates and persists a new one. `force` deletes any existing root
    /// first, invalidating every certificate it ever issued.
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        force: bool,
    ) -> Result<Self, CodegateError> {
        if force {
            let _ = fs::remove_file(cert_path);
            let _ = fs::remove_file(key_path);
        }

        let (ca_cert, ca_key, ca_cert_pem) = if cert_path.exists() && key_path.exists() {
            Self::load_root(cert_path, key_path)?
        } else {
            Self::write_root(cert_path, key_path)?
        };
        let ca_chain = vec![ca_cert.der().clone()];

        info!(cert = %cert_path.display(), "certificate authority ready");
        Ok(Self {
            ca_cert,
            ca_key,
            ca_chain,
            ca_cert_pem,
            cache: StdMutex::new(LeafCache::new(LEAF_CACHE_CAPACITY)),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    fn load_root(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(Certificate, KeyPair, String), CodegateError> {
        let ca_cert_pem = fs::read_to_string(cert_path)?;
        let ca_key_pem = fs::read_to_string(key_path)?;

        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| CodegateError::CaUnavailable(format!("malformed CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| CodegateError::CaUnavailable(format!("malformed CA certificate: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| CodegateError::CaUnavailable(format!("failed to reload CA: {e}")))?;

        Ok((ca_cert, ca_key, ca_cert_pem))
    }

    fn write_root(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(Certificate, KeyPair, String), CodegateError> {
        let (ca_cert, ca_key) = Self::generate_root();
        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_key.serialize_pem();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private_file(key_path, ca_key_pem.as_bytes())?;
        fs::write(cert_path, &ca_cert_pem)?;

        info!("generated new certificate authority root");
        Ok((ca_cert, ca_key, ca_cert_pem))
    }

    fn generate_root() -> (Certificate, KeyPair) {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "CodeGate Proxy Root CA");
        dn.push(DnType::OrganizationName, "CodeGate");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now
            .checked_add(Duration::days(ROOT_VALIDITY_DAYS))
            .unwrap_or(now);

        let key_pair = KeyPair::generate().expect("root key generation must succeed");
        let cert = params
            .self_signed(&key_pair)
            .expect("self-signing the root must succeed");
        (cert, key_pair)
    }

    /// PEM encoding of the root, for clients to install as a trust anchor.
    pub fn root_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns the leaf for `host`, minting and caching one if none is
    /// cached or the cached one is within a day of expiry.
    pub async fn get_leaf(&self, host: &str) -> Result<Arc<LeafCert>, CodegateError> {
        let key = host.to_ascii_lowercase();

        if let Some(leaf) = self.cached_fresh(&key) {
            return Ok(leaf);
        }

        let host_lock = {
            let mut locks = self.locks.lock().expect("ca lock map poisoned");
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = host_lock.lock().await;

        // Someone may have minted while we waited on the lock.
        if let Some(leaf) = self.cached_fresh(&key) {
            return Ok(leaf);
        }

        let leaf = Arc::new(self.mint_leaf(&key)?);
        self.cache
            .lock()
            .expect("ca cache poisoned")
            .insert(key.clone(), leaf.clone());
        debug!(host = %key, "minted leaf certificate");
        Ok(leaf)
    }

    fn cached_fresh(&self, key: &str) -> Option<Arc<LeafCert>> {
        let mut cache = self.cache.lock().expect("ca cache poisoned");
        match cache.get(key) {
            Some(leaf) if leaf.not_after - OffsetDateTime::now_utc() > LEAF_REFRESH_WINDOW => {
                Some(leaf)
            }
            _ => None,
        }
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafCert, CodegateError> {
        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![subject_alt_name(host)?];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        let not_after = now
            .checked_add(Duration::days(LEAF_VALIDITY_DAYS))
            .unwrap_or(now);
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|e| CodegateError::CaUnavailable(format!("failed to generate leaf key: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| {
                CodegateError::CaUnavailable(format!("failed to sign leaf for {host}: {e}"))
            })?;

        let mut chain = Vec::with_capacity(1 + self.ca_chain.len());
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        Ok(LeafCert {
            chain,
            key_der: key_pair.serialize_der(),
            not_after,
        })
    }

    /// Drops every cached leaf. The next request for each host mints fresh.
    pub fn remove_all(&self) {
        self.cache.lock().expect("ca cache poisoned").clear();
        self.locks.lock().expect("ca lock map poisoned").clear();
    }
}

fn subject_alt_name(host: &str) -> Result<SanType, CodegateError> {
    if let Ok(ip) = IpAddr::from_str(host) {
        Ok(SanType::IpAddress(ip))
    } else {
        Ia5String::try_from(host)
            .map(SanType::DnsName)
            .map_err(|_| CodegateError::CaUnavailable(format!("invalid hostname {host:?}")))
    }
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), CodegateError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), CodegateError> {
    fs::write(path, contents)?;
    Ok(())
}

struct LeafCache {
    map: HashMap<String, Arc<LeafCert>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LeafCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<LeafCert>> {
        let leaf = self.map.get(key).cloned();
        if leaf.is_some() {
            self.promote(key);
        }
        leaf
    }

    fn insert(&mut self, key: String, leaf: Arc<LeafCert>) {
        self.map.insert(key.clone(), leaf);
        self.promote(&key);
        self.evict();
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_root_once_and_reuses_it_on_reload() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        let pem_first = {
            let ca = CertificateAuthority::load_or_generate(&cert_path, &key_path, false).unwrap();
            ca.root_cert_pem().to_string()
        };
        assert!(cert_path.exists());
        assert!(key_path.exists());

        let ca = CertificateAuthority::load_or_generate(&cert_path, &key_path, false).unwrap();
        assert_eq!(ca.root_cert_pem(), pem_first);
    }

    #[test]
    fn force_regenerates_a_different_root() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        let first = CertificateAuthority::load_or_generate(&cert_path, &key_path, false)
            .unwrap()
            .root_cert_pem()
            .to_string();
        let second = CertificateAuthority::load_or_generate(&cert_path, &key_path, true)
            .unwrap()
            .root_cert_pem()
            .to_string();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn leaf_certs_are_cached_and_chain_to_the_root() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(
            &dir.path().join("ca.crt"),
            &dir.path().join("ca.key"),
            false,
        )
        .unwrap();

        let leaf_a = ca.get_leaf("example.com").await.unwrap();
        let leaf_b = ca.get_leaf("EXAMPLE.com").await.unwrap();
        assert!(Arc::ptr_eq(&leaf_a, &leaf_b), "lookup should be case-insensitive and cached");
        assert_eq!(leaf_a.chain.len(), 2, "leaf followed by the root");
    }

    #[tokio::test]
    async fn remove_all_forces_a_fresh_mint() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(
            &dir.path().join("ca.crt"),
            &dir.path().join("ca.key"),
            false,
        )
        .unwrap();

        let before = ca.get_leaf("example.com").await.unwrap();
        ca.remove_all();
        let after = ca.get_leaf("example.com").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn mints_for_ip_hosts() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(
            &dir.path().join("ca.crt"),
            &dir.path().join("ca.key"),
            false,
        )
        .unwrap();
        assert!(ca.get_leaf("127.0.0.1").await.is_ok());
    }
}
