//! Certificate verification helpers and the device-trust probe

use rcgen::{KeyPair, PublicKeyData};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;
use std::net::IpAddr;
use std::sync::Arc;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::parse_x509_certificate;

use crate::error::{Error, Result};

/// Whether `key` is the private half of the public key in `cert_der`.
pub fn verify_key_match(cert_der: &[u8], key: &KeyPair) -> bool {
    match parse_x509_certificate(cert_der) {
        Ok((_, cert)) => cert.public_key().subject_public_key.data.as_ref() == key.der_bytes(),
        Err(_) => false,
    }
}

/// Whether `leaf_der` names `root_der`'s subject as issuer and carries a
/// signature that verifies under the root's public key.
pub fn verify_issued_by(leaf_der: &[u8], root_der: &[u8]) -> bool {
    let (Ok((_, leaf)), Ok((_, root))) =
        (parse_x509_certificate(leaf_der), parse_x509_certificate(root_der))
    else {
        return false;
    };

    leaf.issuer().as_raw() == root.subject().as_raw()
        && leaf.verify_signature(Some(root.public_key())).is_ok()
}

/// DNS names and IP addresses from the subject alternative name extension.
pub fn subject_alt_names(cert_der: &[u8]) -> Result<Vec<String>> {
    let (_, cert) = parse_x509_certificate(cert_der)
        .map_err(|e| Error::certificate(format!("Failed to parse certificate: {}", e)))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| Error::certificate(format!("Invalid subject alternative name: {}", e)))?;

    let Some(san) = san else {
        return Ok(Vec::new());
    };

    let names = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::IPAddress(bytes) => ip_from_octets(bytes).map(|ip| ip.to_string()),
            _ => None,
        })
        .collect();
    Ok(names)
}

fn ip_from_octets(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Platform trust evaluation for an issued chain.
///
/// The proxy never consults this itself. It exists for the surrounding
/// application, which polls it to tell the user whether the root has been
/// installed as trusted.
pub trait TrustProbe: Send + Sync {
    /// `chain` is leaf first.
    fn is_trusted(&self, chain: &[CertificateDer<'static>], hostname: &str) -> bool;
}

/// Trust probe backed by the rustls WebPKI verifier and a chosen root store.
pub struct WebPkiTrustProbe {
    verifier: Arc<WebPkiServerVerifier>,
}

impl WebPkiTrustProbe {
    pub fn new(roots: RootCertStore) -> Result<Self> {
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), super::crypto_provider())
                .build()
                .map_err(|e| Error::tls(format!("Failed to build verifier: {}", e)))?;
        Ok(Self { verifier })
    }

    /// A probe that trusts exactly one root certificate.
    pub fn trusting(root: &CertificateDer<'static>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots
            .add(root.clone())
            .map_err(|e| Error::tls(format!("Failed to add trust anchor: {}", e)))?;
        Self::new(roots)
    }
}

impl TrustProbe for WebPkiTrustProbe {
    fn is_trusted(&self, chain: &[CertificateDer<'static>], hostname: &str) -> bool {
        let Some((leaf, intermediates)) = chain.split_first() else {
            return false;
        };
        let Ok(server_name) = ServerName::try_from(hostname.to_string()) else {
            return false;
        };

        self.verifier
            .verify_server_cert(leaf, intermediates, &server_name, &[], UnixTime::now())
            .is_ok()
    }
}
