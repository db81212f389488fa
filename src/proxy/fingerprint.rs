//! Outbound TLS fingerprint variation
//!
//! Each upstream proxy gets its own order of TLS cipher suites, so two proxies
//! of the same project never present the same ClientHello and none presents
//! the stock one. The permutation is derived from the proxy id and computed
//! once.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme, SupportedCipherSuite};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::error::{Result, RotorError};
use crate::models::{CertificatePem, ProjectToConnect};

const MAX_DERIVATIONS: u32 = 4096;

/// Accepts any server certificate but still checks handshake signatures
///
/// Upstream proxies and scraped origins routinely present self-signed or
/// mismatched certificates.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn build_client_config(
    cipher_suites: Vec<SupportedCipherSuite>,
    client_auth: Option<&CertificatePem>,
) -> Result<Arc<ClientConfig>> {
    let provider = CryptoProvider {
        cipher_suites,
        ..ring::default_provider()
    };
    let verifier = Arc::new(AcceptAnyServerCert::new(&provider));

    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match client_auth {
        Some(pem) => {
            let certs = rustls_pemfile::certs(&mut pem.cert.as_bytes())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RotorError::Certificate(format!("Invalid client certificate: {}", e)))?;
            let key = rustls_pemfile::private_key(&mut pem.key.as_bytes())
                .map_err(|e| RotorError::Certificate(format!("Invalid client key: {}", e)))?
                .ok_or_else(|| RotorError::Certificate("No private key found".to_string()))?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Client config for the TLS hop to a proxy, optionally presenting a client
/// certificate
pub fn proxy_tls_config(client_auth: Option<&CertificatePem>) -> Result<Arc<ClientConfig>> {
    build_client_config(ring::default_provider().cipher_suites, client_auth)
}

fn suite_ids(suites: &[SupportedCipherSuite]) -> Vec<u16> {
    suites.iter().map(|s| u16::from(s.suite())).collect()
}

/// Deterministic permutation of `baseline` for `proxy_id`
///
/// Orders rejected by `taken` (and the baseline itself) are re-derived with
/// an incremented salt.
fn derive_order<F>(
    proxy_id: &str,
    baseline: &[SupportedCipherSuite],
    taken: F,
) -> Result<Vec<SupportedCipherSuite>>
where
    F: Fn(&[u16]) -> bool,
{
    let baseline_ids = suite_ids(baseline);

    for salt in 0..MAX_DERIVATIONS {
        let mut hasher = Sha256::new();
        hasher.update(proxy_id.as_bytes());
        if salt > 0 {
            hasher.update(salt.to_be_bytes());
        }
        let seed: [u8; 32] = hasher.finalize().into();

        let mut rng = StdRng::from_seed(seed);
        let mut order = baseline.to_vec();
        order.shuffle(&mut rng);

        let ids = suite_ids(&order);
        if ids != baseline_ids && !taken(&ids) {
            return Ok(order);
        }
    }

    Err(RotorError::Internal(format!(
        "Cannot derive a unique cipher order for proxy {}",
        proxy_id
    )))
}

struct Shuffled {
    order: Vec<u16>,
    config: Arc<ClientConfig>,
}

/// Per-proxy cipher order cache
pub struct CipherShuffler {
    baseline: Vec<SupportedCipherSuite>,
    default_config: Arc<ClientConfig>,
    by_proxy: DashMap<String, Arc<Shuffled>>,
    by_project: DashMap<String, HashSet<Vec<u16>>>,
}

impl CipherShuffler {
    pub fn new() -> Result<Self> {
        let baseline = ring::default_provider().cipher_suites;
        let default_config = build_client_config(baseline.clone(), None)?;
        Ok(Self {
            baseline,
            default_config,
            by_proxy: DashMap::new(),
            by_project: DashMap::new(),
        })
    }

    /// Config used when shuffling is off
    pub fn default_config(&self) -> Arc<ClientConfig> {
        self.default_config.clone()
    }

    /// Outbound TLS config for requests of `project` through `proxy_id`
    #[instrument(skip(self, project), fields(project_id = %project.id))]
    pub fn client_config(
        &self,
        project: &ProjectToConnect,
        proxy_id: &str,
    ) -> Result<Arc<ClientConfig>> {
        if !project.ciphers_shuffle {
            return Ok(self.default_config());
        }

        if let Some(shuffled) = self.by_proxy.get(proxy_id) {
            return Ok(shuffled.config.clone());
        }

        // The project entry stays locked while deriving so two proxies of the
        // same project cannot claim the same order
        let mut used = self.by_project.entry(project.id.clone()).or_default();
        if let Some(shuffled) = self.by_proxy.get(proxy_id) {
            return Ok(shuffled.config.clone());
        }

        let order = derive_order(proxy_id, &self.baseline, |ids| used.contains(ids))?;
        let ids = suite_ids(&order);
        let config = build_client_config(order, None)?;
        used.insert(ids.clone());

        debug!(order = ?ids, "Derived cipher order");

        let shuffled = self
            .by_proxy
            .entry(proxy_id.to_string())
            .or_insert_with(|| Arc::new(Shuffled { order: ids, config }))
            .clone();
        Ok(shuffled.config.clone())
    }

    /// Cipher suite ids cached for `proxy_id`
    pub fn order_of(&self, proxy_id: &str) -> Option<Vec<u16>> {
        self.by_proxy.get(proxy_id).map(|s| s.order.clone())
    }

    /// Forget a proxy that left the pool
    pub fn forget(&self, project_id: &str, proxy_id: &str) {
        if let Some((_, shuffled)) = self.by_proxy.remove(proxy_id) {
            if let Some(mut used) = self.by_project.get_mut(project_id) {
                used.remove(&shuffled.order);
            }
        }
    }
}

/// Short hex digest of the cipher order a config offers
pub fn cipher_digest(config: &ClientConfig) -> String {
    let mut hasher = Sha256::new();
    for id in suite_ids(&config.crypto_provider().cipher_suites) {
        hasher.update(id.to_be_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Cipher suites offered in the first ClientHello `config` would send
pub fn client_hello_cipher_suites(config: Arc<ClientConfig>, server_name: &str) -> Result<Vec<u16>> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| RotorError::Tls(format!("Invalid server name: {}", e)))?;
    let mut conn = rustls::ClientConnection::new(config, name)?;

    let mut wire = Vec::new();
    conn.write_tls(&mut wire)?;
    parse_client_hello_cipher_suites(&wire)
}

fn parse_client_hello_cipher_suites(wire: &[u8]) -> Result<Vec<u16>> {
    let malformed = || RotorError::Tls("Malformed ClientHello".to_string());

    // record header (5) + handshake header (4) + version (2) + random (32)
    if wire.len() < 44 || wire[0] != 0x16 || wire[5] != 0x01 {
        return Err(malformed());
    }
    let session_id_len = wire[43] as usize;
    let mut pos = 44 + session_id_len;

    let len_bytes = wire.get(pos..pos + 2).ok_or_else(malformed)?;
    let suites_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    pos += 2;

    let suites = wire.get(pos..pos + suites_len).ok_or_else(malformed)?;
    Ok(suites
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}
