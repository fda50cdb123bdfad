//! Certificate authority and per-hostname leaf minting.
//!
//! The CA key and certificate are supplied by the caller (PEM strings or
//! file paths). Leaf certificates are minted on demand, keyed by the SNI
//! hostname (or the CONNECT target when no SNI was sent), and cached for
//! the lifetime of the server instance. `reset()` deliberately does not
//! evict the cache, so certificates stay stable across tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tracing::debug;

use super::{certs_from_pem, init_crypto};
use crate::config::HttpsOptions;
use crate::error::{MockError, Result};

/// A leaf certificate minted for one hostname.
pub(crate) struct MintedCert {
    pub cert_pem: String,
    pub key_pem: String,
    chain: Vec<CertificateDer<'static>>,
    key_pkcs8: Vec<u8>,
}

impl MintedCert {
    pub(crate) fn chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()))
    }
}

pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    signer: Certificate,
    serial_seed: u64,
    cache: RwLock<HashMap<String, Arc<MintedCert>>>,
}

impl CertificateAuthority {
    /// Build from caller-supplied HTTPS options, loading PEM material from
    /// disk where paths were given.
    pub fn from_options(options: &HttpsOptions) -> Result<Self> {
        options.validate()?;
        init_crypto();

        let key_pem = match (&options.key, &options.key_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                MockError::Tls(format!("failed to read CA key {}: {e}", path.display()))
            })?,
            _ => unreachable!("validated above"),
        };
        let cert_pem = match (&options.cert, &options.cert_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                MockError::Tls(format!("failed to read CA cert {}: {e}", path.display()))
            })?,
            _ => unreachable!("validated above"),
        };

        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        init_crypto();
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| MockError::Tls(format!("failed to parse CA key: {e}")))?;
        // Rebuild the signer from the real CA certificate so minted leaves
        // carry the correct issuer DN.
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| MockError::Tls(format!("failed to parse CA certificate: {e}")))?;
        let signer = Certificate::from_params(params)
            .map_err(|e| MockError::Tls(format!("failed to reconstruct CA signer: {e}")))?;

        let ca_cert_der = certs_from_pem(cert_pem)?
            .into_iter()
            .next()
            .expect("certs_from_pem returned at least one certificate");

        Ok(Self {
            ca_cert_pem: cert_pem.to_string(),
            serial_seed: fnv1a(cert_pem.as_bytes()),
            ca_cert_der,
            signer,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// The CA certificate in PEM form, for clients that need to trust it.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Mint (or fetch from cache) the leaf certificate for a hostname.
    pub(crate) fn cert_for_host(&self, host: &str) -> Result<Arc<MintedCert>> {
        if let Some(cert) = self.cache.read().get(host) {
            return Ok(Arc::clone(cert));
        }

        let mut cache = self.cache.write();
        // Another connection may have minted while we waited for the lock.
        if let Some(cert) = cache.get(host) {
            return Ok(Arc::clone(cert));
        }

        debug!(host, "minting leaf certificate");
        let minted = Arc::new(self.mint(host)?);
        cache.insert(host.to_string(), Arc::clone(&minted));
        Ok(minted)
    }

    fn mint(&self, host: &str) -> Result<MintedCert> {
        let mut params = CertificateParams::new(Vec::new());
        params.is_ca = IsCa::NoCa;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.to_string()));
            if host.contains('.') && !host.starts_with("*.") {
                params
                    .subject_alt_names
                    .push(SanType::DnsName(format!("*.{host}")));
            }
        }

        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated a day and valid for a year, at date granularity.
        let not_before = Utc::now() - ChronoDuration::days(1);
        let not_after = Utc::now() + ChronoDuration::days(365);
        params.not_before = rcgen::date_time_ymd(
            not_before.year(),
            not_before.month() as u8,
            not_before.day() as u8,
        );
        params.not_after = rcgen::date_time_ymd(
            not_after.year(),
            not_after.month() as u8,
            not_after.day() as u8,
        );

        params.serial_number = Some((fnv1a(host.as_bytes()) ^ self.serial_seed).into());

        let cert = Certificate::from_params(params)
            .map_err(|e| MockError::Tls(format!("failed to generate leaf key: {e}")))?;
        let leaf_der = cert
            .serialize_der_with_signer(&self.signer)
            .map_err(|e| MockError::Tls(format!("failed to sign leaf certificate: {e}")))?;
        let cert_pem = cert
            .serialize_pem_with_signer(&self.signer)
            .map_err(|e| MockError::Tls(format!("failed to serialize leaf certificate: {e}")))?;

        Ok(MintedCert {
            cert_pem,
            key_pem: cert.serialize_private_key_pem(),
            chain: vec![CertificateDer::from(leaf_der), self.ca_cert_der.clone()],
            key_pkcs8: cert.serialize_private_key_der(),
        })
    }

    /// A rustls server config presenting the leaf for `host`, offering the
    /// given ALPN protocols.
    pub(crate) fn server_config_for(
        &self,
        host: &str,
        alpn: Vec<Vec<u8>>,
    ) -> Result<Arc<ServerConfig>> {
        let minted = self.cert_for_host(host)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(minted.chain(), minted.private_key())
            .map_err(|e| MockError::Tls(format!("failed to build TLS config: {e}")))?;
        config.alpn_protocols = alpn;
        Ok(Arc::new(config))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Generate a fresh CA for tests and local use; returns (cert PEM, key PEM).
pub fn generate_ca(common_name: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "mirage");
    params.distinguished_name = dn;

    let cert = Certificate::from_params(params)
        .map_err(|e| MockError::Tls(format!("failed to generate CA: {e}")))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| MockError::Tls(format!("failed to serialize CA: {e}")))?;
    Ok((cert_pem, cert.serialize_private_key_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> CertificateAuthority {
        let (cert, key) = generate_ca("mirage test CA").unwrap();
        CertificateAuthority::from_pem(&cert, &key).unwrap()
    }

    #[test]
    fn mints_and_caches_by_hostname() {
        let ca = authority();
        let first = ca.cert_for_host("example.test").unwrap();
        let second = ca.cert_for_host("example.test").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca.cert_for_host("other.test").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn leaf_chain_contains_leaf_and_ca() {
        let ca = authority();
        let minted = ca.cert_for_host("example.test").unwrap();
        assert_eq!(minted.chain().len(), 2);
        assert!(minted.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(minted.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn ip_hosts_get_ip_sans() {
        let ca = authority();
        // Must not fail to mint for an address literal.
        ca.cert_for_host("127.0.0.1").unwrap();
    }

    #[test]
    fn server_config_carries_alpn() {
        let ca = authority();
        let config = ca
            .server_config_for("example.test", vec![b"h2".to_vec(), b"http/1.1".to_vec()])
            .unwrap();
        assert_eq!(config.alpn_protocols.len(), 2);
    }

    #[test]
    fn invalid_pem_is_rejected() {
        assert!(CertificateAuthority::from_pem("not a cert", "not a key").is_err());
    }
}
