//! TLS plumbing: PEM parsing, the development trust-bypass verifier, and
//! crypto provider setup.

mod ca;

pub use ca::{generate_ca, CertificateAuthority};

use std::sync::Arc;
use std::sync::Once;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;

use crate::error::{MockError, Result};

static INIT_CRYPTO: Once = Once::new();

/// Install a process default crypto provider exactly once. Safe to call
/// from every server constructor.
pub(crate) fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Certificate verifier that accepts anything. Used for destinations listed
/// in `ignore_host_certificate_errors`; never for other traffic.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

/// Client config that skips certificate verification entirely.
pub(crate) fn insecure_client_config() -> rustls::ClientConfig {
    init_crypto();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
}

pub(crate) fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| MockError::Tls(format!("failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(MockError::Tls("no certificates found in PEM".into()));
    }
    Ok(certs)
}

pub(crate) fn key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| MockError::Tls(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| MockError::Tls("no private key found in PEM".into()))
}

/// True when `host[:port]` matches one of the bypass patterns. Patterns are
/// either an explicit `host:port` or a glob over the hostname where `*`
/// matches any run of characters.
pub(crate) fn destination_matches(patterns: &[String], host: &str, port: u16) -> bool {
    let with_port = format!("{host}:{port}");
    patterns.iter().any(|pattern| {
        if pattern.contains(':') {
            glob_matches(pattern, &with_port)
        } else {
            glob_matches(pattern, host)
        }
    })
}

fn glob_matches(pattern: &str, target: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
            regex.push_str(".*");
        }
        regex.push_str(&regex::escape(part));
    }
    regex.push('$');
    regex::Regex::new(&regex)
        .map(|re| re.is_match(target))
        .unwrap_or(false)
}
