//! MITM certificate issuance
//!
//! Leaf certificates are signed on the fly by the project CA and cached per
//! `(project, hostname)`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::error::{Result, RotorError};
use crate::models::CertificatePem;

/// Clock skew tolerance applied to the start of a leaf's validity
const BACKDATE: Duration = Duration::from_secs(60 * 60);

/// Cached entries are re-issued this long before they expire
const RENEW_MARGIN: Duration = Duration::from_secs(60);

/// Digest identifying a CA by its certificate and key
pub fn ca_digest(pem: &CertificatePem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pem.cert.as_bytes());
    hasher.update(pem.key.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// A project CA able to sign leaf certificates
pub struct CertificateAuthority {
    params: CertificateParams,
    issuer: Certificate,
    key: KeyPair,
    chain_der: CertificateDer<'static>,
    digest: String,
}

impl CertificateAuthority {
    pub fn from_pem(pem: &CertificatePem) -> Result<Self> {
        let key = KeyPair::from_pem(&pem.key)?;
        let params = CertificateParams::from_ca_cert_pem(&pem.cert)?;
        let issuer = params.clone().self_signed(&key)?;

        let chain_der = rustls_pemfile::certs(&mut pem.cert.as_bytes())
            .next()
            .ok_or_else(|| RotorError::Certificate("No CA certificate found".to_string()))?
            .map_err(|e| RotorError::Certificate(format!("Invalid CA certificate: {}", e)))?;

        Ok(Self {
            params,
            issuer,
            key,
            chain_der,
            digest: ca_digest(pem),
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Sign a fresh leaf for `hostname` valid for `duration`
    pub fn issue(&self, hostname: &str, duration: Duration) -> Result<MitmCertificate> {
        let mut params = CertificateParams::new(vec![hostname.to_string()])?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let mut serial = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        if serial[0] == 0 {
            serial[0] = 0x01;
        }
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let now = SystemTime::now();
        params.not_before = (now - BACKDATE).into();
        params.not_after = (now + duration).into();
        if params.not_before < self.params.not_before {
            params.not_before = self.params.not_before;
        }
        if params.not_after > self.params.not_after {
            params.not_after = self.params.not_after;
        }
        if params.not_after <= params.not_before {
            return Err(RotorError::Certificate(
                "Project CA is expired or not yet valid".to_string(),
            ));
        }
        let expires_at: SystemTime = params.not_after.into();

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.issuer, &self.key)?;

        let cert_der = leaf.der().clone();
        let key_der = leaf_key.serialize_der();

        let mut server_config =
            ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_single_cert(
                    vec![cert_der.clone(), self.chain_der.clone()],
                    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.clone())),
                )?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(MitmCertificate {
            hostname: hostname.to_string(),
            cert_der,
            key_der,
            server_config: Arc::new(server_config),
            expires_at,
            ca_digest: self.digest.clone(),
        })
    }
}

/// Leaf certificate presented to clients for one hostname
pub struct MitmCertificate {
    pub hostname: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub server_config: Arc<ServerConfig>,
    pub expires_at: SystemTime,
    pub ca_digest: String,
}

impl MitmCertificate {
    fn is_fresh(&self, ca_digest: &str) -> bool {
        self.ca_digest == ca_digest && SystemTime::now() + RENEW_MARGIN < self.expires_at
    }
}

/// Concurrent cache of issued leaves keyed by `(project_id, hostname)`
pub struct MitmCertCache {
    duration: Duration,
    authorities: DashMap<String, Arc<CertificateAuthority>>,
    certificates: DashMap<(String, String), Arc<MitmCertificate>>,
}

impl MitmCertCache {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            authorities: DashMap::new(),
            certificates: DashMap::new(),
        }
    }

    fn authority(&self, project_id: &str, ca: &CertificatePem) -> Result<Arc<CertificateAuthority>> {
        let digest = ca_digest(ca);
        if let Some(existing) = self.authorities.get(project_id) {
            if existing.digest == digest {
                return Ok(existing.clone());
            }
        }

        let authority = Arc::new(CertificateAuthority::from_pem(ca)?);
        if let Some(previous) = self.authorities.insert(project_id.to_string(), authority.clone()) {
            if previous.digest != digest {
                info!(project_id = %project_id, "Project CA changed, purging issued certificates");
                self.purge_certificates(project_id);
            }
        }
        Ok(authority)
    }

    /// Certificate for `hostname`, issuing one if needed. The first issued
    /// certificate wins when several connections race.
    #[instrument(skip(self, ca))]
    pub fn get_or_issue(
        &self,
        project_id: &str,
        ca: &CertificatePem,
        hostname: &str,
    ) -> Result<Arc<MitmCertificate>> {
        let authority = self.authority(project_id, ca)?;
        let key = (project_id.to_string(), hostname.to_ascii_lowercase());

        if let Some(cached) = self.certificates.get(&key) {
            if cached.is_fresh(authority.digest()) {
                return Ok(cached.clone());
            }
        }

        debug!("Issuing certificate");
        let issued = Arc::new(authority.issue(hostname, self.duration)?);

        let certificate = match self.certificates.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_fresh(authority.digest()) {
                    occupied.get().clone()
                } else {
                    occupied.insert(issued.clone());
                    issued
                }
            }
            Entry::Vacant(vacant) => vacant.insert(issued).value().clone(),
        };
        Ok(certificate)
    }

    fn purge_certificates(&self, project_id: &str) {
        self.certificates.retain(|(project, _), _| project != project_id);
    }

    /// Drop the project's CA and every certificate it issued
    pub fn invalidate_project(&self, project_id: &str) {
        self.authorities.remove(project_id);
        self.purge_certificates(project_id);
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

/// Whether `hostname` is an IP literal (IP SAN instead of DNS SAN)
pub fn is_ip_literal(hostname: &str) -> bool {
    hostname
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}
