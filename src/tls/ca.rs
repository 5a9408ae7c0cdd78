//! Certificate Authority management
//!
//! A [`CertificateAuthority`] owns the single active [`RootIdentity`] of an
//! installation. The root is loaded from (or generated into) a
//! [`CredentialStore`] once, kept in memory, and only ever replaced whole.
//! Leaf issuance holds the read side of the root lock for the duration of
//! signing, so a concurrent replacement waits until in-flight leaves are done.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use time::{Duration, OffsetDateTime, Time};

use super::verify::{self, TrustProbe};
use crate::error::{Error, Result};
use crate::store::{self, CredentialStore};

/// Root validity, counted from the start of the issuance day.
pub const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Leaf validity, counted from the start of the issuance day.
pub const LEAF_VALIDITY_DAYS: i64 = 730;

const ROOT_COMMON_NAME: &str = "Tapwire Root CA";
const LEAF_COMMON_NAME: &str = "Tapwire Interception";
const ORGANIZATION: &str = "Tapwire";

/// The CA's private key and self-signed certificate.
pub struct RootIdentity {
    issuer: Issuer<'static, KeyPair>,
    key_der: Vec<u8>,
    cert_der: CertificateDer<'static>,
    fingerprint: String,
}

impl std::fmt::Debug for RootIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl RootIdentity {
    /// Generate a fresh P-256 key and self-signed CA certificate.
    pub fn generate() -> Result<Self> {
        Self::generate_at(OffsetDateTime::now_utc())
    }

    fn generate_at(now: OffsetDateTime) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, "JP");
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::OrganizationalUnitName, "Interception");
        params.distinguished_name = dn;

        // No path length limit. Basic constraints and key usage are both critical.
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];

        params.serial_number = Some(random_serial());
        params.not_before = day_start(now);
        params.not_after = params.not_before + Duration::days(ROOT_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(format!("Failed to self-sign root: {}", e)))?;

        let key_der = key_pair.serialize_der();
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let fingerprint = fingerprint(&cert_der);

        Ok(Self {
            issuer: Issuer::new(params, key_pair),
            key_der,
            cert_der,
            fingerprint,
        })
    }

    /// Rebuild an identity from its persisted PKCS#8 key and DER certificate.
    ///
    /// Fails if either blob does not parse or if the key does not belong to
    /// the certificate.
    pub fn from_der(key_der: &[u8], cert_der: &[u8]) -> Result<Self> {
        let key_pair = KeyPair::try_from(key_der)
            .map_err(|e| Error::certificate(format!("Failed to parse root private key: {}", e)))?;
        let cert_der = CertificateDer::from(cert_der.to_vec());

        if !verify::verify_key_match(&cert_der, &key_pair) {
            return Err(Error::certificate(
                "Root private key does not match the root certificate",
            ));
        }

        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|e| Error::certificate(format!("Failed to parse root certificate: {}", e)))?;
        let fingerprint = fingerprint(&cert_der);

        Ok(Self {
            issuer,
            key_der: key_der.to_vec(),
            cert_der,
            fingerprint,
        })
    }

    /// DER-encoded root certificate.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM-encoded root certificate, for export and download.
    pub fn cert_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.cert_der.to_vec()))
    }

    /// PKCS#8 DER private key.
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Uppercase hex SHA-256 of the certificate DER.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Issue a leaf certificate for `hosts`, signed by this root.
    pub fn issue_leaf(&self, hosts: &[String]) -> Result<LeafCertificate> {
        self.issue_leaf_at(hosts, OffsetDateTime::now_utc())
    }

    pub(crate) fn issue_leaf_at(
        &self,
        hosts: &[String],
        now: OffsetDateTime,
    ) -> Result<LeafCertificate> {
        if hosts.is_empty() {
            return Err(Error::certificate("Leaf certificate needs at least one host"));
        }

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, LEAF_COMMON_NAME);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        params.subject_alt_names = hosts
            .iter()
            .map(|host| san_for_host(host))
            .collect::<Result<Vec<_>>>()?;

        // Explicitly not a CA, which also emits the subject key identifier.
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::OcspSigning,
        ];
        params.use_authority_key_identifier_extension = true;

        params.serial_number = Some(random_serial());
        params.not_before = day_start(now);
        params.not_after = params.not_before + Duration::days(LEAF_VALIDITY_DAYS);

        let leaf_key = KeyPair::generate().map_err(|e| Error::signing(e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| Error::signing(format!("Failed to sign leaf certificate: {}", e)))?;

        Ok(LeafCertificate {
            cert_der: CertificateDer::from(cert.der().to_vec()),
            key_der: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
            root_der: self.cert_der.clone(),
            root_fingerprint: self.fingerprint.clone(),
            hosts: hosts.to_vec(),
        })
    }
}

/// A host-scoped certificate chained to a [`RootIdentity`].
pub struct LeafCertificate {
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    root_der: CertificateDer<'static>,
    root_fingerprint: String,
    hosts: Vec<String>,
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hosts", &self.hosts)
            .field("root_fingerprint", &self.root_fingerprint)
            .finish()
    }
}

impl LeafCertificate {
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }

    /// Chain to present during a handshake: leaf first, then the root.
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone(), self.root_der.clone()]
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Fingerprint of the root that signed this leaf.
    pub fn root_fingerprint(&self) -> &str {
        &self.root_fingerprint
    }
}

/// The installation's certificate authority.
pub struct CertificateAuthority {
    store: Arc<dyn CredentialStore>,
    root: RwLock<Arc<RootIdentity>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root", &self.root())
            .finish()
    }
}

impl CertificateAuthority {
    /// Load the persisted root, or generate and persist a new one when the
    /// store has none or holds one that does not parse.
    ///
    /// Only a failing store is reported as an error.
    pub fn ensure(store: Arc<dyn CredentialStore>) -> Result<Self> {
        let root = match load_root(store.as_ref())? {
            Some(root) => {
                tracing::info!(fingerprint = %root.fingerprint(), "Loaded root certificate");
                root
            }
            None => {
                let root = RootIdentity::generate()?;
                persist_root(store.as_ref(), &root)?;
                tracing::info!(fingerprint = %root.fingerprint(), "Generated new root certificate");
                root
            }
        };

        Ok(Self {
            store,
            root: RwLock::new(Arc::new(root)),
        })
    }

    /// The active root.
    pub fn root(&self) -> Arc<RootIdentity> {
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist `identity` and make it the active root.
    pub fn set_root(&self, identity: RootIdentity) -> Result<Arc<RootIdentity>> {
        let mut active = self.root.write().unwrap_or_else(PoisonError::into_inner);
        persist_root(self.store.as_ref(), &identity)?;

        let identity = Arc::new(identity);
        *active = identity.clone();
        Ok(identity)
    }

    /// Replace the root with a freshly generated one.
    ///
    /// Leaves issued under the previous root stop chaining to the active one.
    pub fn regenerate_root(&self) -> Result<Arc<RootIdentity>> {
        let identity = RootIdentity::generate()?;
        let identity = self.set_root(identity)?;
        tracing::info!(fingerprint = %identity.fingerprint(), "Regenerated root certificate");
        Ok(identity)
    }

    /// Issue a leaf for `hosts` under the active root.
    pub fn issue_leaf(&self, hosts: &[String]) -> Result<LeafCertificate> {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        root.issue_leaf(hosts)
    }

    /// Ask `probe` whether a leaf for `hostname` would be trusted right now.
    pub fn is_trusted(&self, probe: &dyn TrustProbe, hostname: &str) -> bool {
        match self.issue_leaf(&[hostname.to_string()]) {
            Ok(leaf) => probe.is_trusted(&leaf.chain(), hostname),
            Err(e) => {
                tracing::debug!(hostname = %hostname, error = %e, "Trust probe could not issue leaf");
                false
            }
        }
    }
}

fn load_root(store: &dyn CredentialStore) -> Result<Option<RootIdentity>> {
    let key = store.get(store::PRIVATE_KEY)?;
    let cert = store.get(store::CERTIFICATE)?;

    let (Some(key), Some(cert)) = (key, cert) else {
        return Ok(None);
    };

    match RootIdentity::from_der(&key, &cert) {
        Ok(root) => Ok(Some(root)),
        Err(e) => {
            tracing::warn!(error = %e, "Stored root is unusable, generating a new one");
            Ok(None)
        }
    }
}

/// Write the certificate, then the key. When the key write fails the previous
/// certificate is put back, so the store keeps the pair it already had.
fn persist_root(store: &dyn CredentialStore, root: &RootIdentity) -> Result<()> {
    let previous_cert = store.get(store::CERTIFICATE)?;
    store.set(store::CERTIFICATE, root.cert_der())?;

    if let Err(e) = store.set(store::PRIVATE_KEY, root.key_der()) {
        if let Some(cert) = previous_cert {
            if let Err(restore) = store.set(store::CERTIFICATE, &cert) {
                tracing::error!(error = %restore, "Failed to restore previous root certificate");
            }
        }
        return Err(e);
    }
    Ok(())
}

fn san_for_host(host: &str) -> Result<SanType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = host
        .try_into()
        .map_err(|e| Error::certificate(format!("Invalid hostname '{}': {}", host, e)))?;
    Ok(SanType::DnsName(name))
}

/// 20 random octets. The top bit is cleared so the integer stays positive and
/// the next one is set so the encoding keeps its full length.
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 20] = rand::random();
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

fn day_start(now: OffsetDateTime) -> OffsetDateTime {
    now.to_offset(time::UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}

fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use x509_parser::prelude::*;
    use super::verify;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn memory_ca() -> (Arc<MemoryStore>, CertificateAuthority) {
        let store = Arc::new(MemoryStore::new());
        let ca = CertificateAuthority::ensure(store.clone()).unwrap();
        (store, ca)
    }

    /// Memory store whose key writes can be switched to fail.
    #[derive(Default)]
    struct KeyWriteFails {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl CredentialStore for KeyWriteFails {
        fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(name)
        }

        fn set(&self, name: &str, value: &[u8]) -> Result<()> {
            if name == store::PRIVATE_KEY && self.failing.load(Ordering::SeqCst) {
                return Err(Error::store("disk full"));
            }
            self.inner.set(name, value)
        }
    }

    #[test]
    fn test_generated_root_matches_its_key() {
        let root = RootIdentity::generate().unwrap();
        let key = KeyPair::try_from(root.key_der()).unwrap();
        assert!(verify::verify_key_match(root.cert_der(), &key));
        assert!(root.cert_pem().contains("BEGIN CERTIFICATE"));
        assert_eq!(root.fingerprint().len(), 64);
    }

    #[test]
    fn test_root_extensions() {
        let root = RootIdentity::generate().unwrap();
        let (_, cert) = parse_x509_certificate(root.cert_der()).unwrap();

        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(bc.critical);
        assert!(bc.value.ca);
        assert!(bc.value.path_len_constraint.is_none());

        let ku = cert.key_usage().unwrap().unwrap();
        assert!(ku.critical);
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_cert_sign());

        assert_eq!(cert.subject().as_raw(), cert.issuer().as_raw());
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert_eq!(not_before % 86_400, 0);
        assert_eq!(not_after - not_before, ROOT_VALIDITY_DAYS * 86_400);
    }

    #[test]
    fn test_leaf_chains_to_root() {
        let root = RootIdentity::generate().unwrap();
        let leaf = root.issue_leaf(&hosts(&["api.example.com"])).unwrap();

        assert!(verify::verify_issued_by(leaf.cert_der(), root.cert_der()));
        assert_eq!(leaf.chain().len(), 2);
        assert_eq!(leaf.root_fingerprint(), root.fingerprint());
    }

    #[test]
    fn test_leaf_extensions() {
        let root = RootIdentity::generate().unwrap();
        let leaf = root.issue_leaf(&hosts(&["api.example.com"])).unwrap();
        let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();

        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(!bc.value.ca);

        let ku = cert.key_usage().unwrap().unwrap();
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_cert_sign());

        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        assert!(eku.value.ocsp_signing);

        let has_ski = cert
            .extensions()
            .iter()
            .any(|ext| matches!(ext.parsed_extension(), ParsedExtension::SubjectKeyIdentifier(_)));
        assert!(has_ski);

        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert_eq!(not_after - not_before, LEAF_VALIDITY_DAYS * 86_400);
    }

    #[test]
    fn test_leaf_san_is_exactly_the_host_set() {
        let root = RootIdentity::generate().unwrap();
        let requested = hosts(&["a.example.com", "b.example.com", "10.0.0.7"]);
        let leaf = root.issue_leaf(&requested).unwrap();

        let mut names = verify::subject_alt_names(leaf.cert_der()).unwrap();
        names.sort();
        let mut expected = requested.clone();
        expected.sort();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_leaf_not_before_is_day_start() {
        let root = RootIdentity::generate().unwrap();
        let midnight = 1_773_446_400;
        let early = OffsetDateTime::from_unix_timestamp(midnight + 1).unwrap();
        let late = OffsetDateTime::from_unix_timestamp(midnight + 86_399).unwrap();

        for now in [early, late] {
            let leaf = root.issue_leaf_at(&hosts(&["example.com"]), now).unwrap();
            let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
            assert_eq!(cert.validity().not_before.timestamp(), midnight);
        }
    }

    #[test]
    fn test_serials_differ() {
        let root = RootIdentity::generate().unwrap();
        let a = root.issue_leaf(&hosts(&["example.com"])).unwrap();
        let b = root.issue_leaf(&hosts(&["example.com"])).unwrap();
        let (_, a) = parse_x509_certificate(a.cert_der()).unwrap();
        let (_, b) = parse_x509_certificate(b.cert_der()).unwrap();
        assert_ne!(a.raw_serial(), b.raw_serial());
        assert!(a.raw_serial().len() >= 16);
    }

    #[test]
    fn test_empty_host_set_rejected() {
        let root = RootIdentity::generate().unwrap();
        assert!(root.issue_leaf(&[]).is_err());
    }

    #[test]
    fn test_ensure_persists_and_reloads() {
        let (store, ca) = memory_ca();
        assert!(store.get(store::PRIVATE_KEY).unwrap().is_some());
        assert!(store.get(store::CERTIFICATE).unwrap().is_some());

        let reloaded = CertificateAuthority::ensure(store).unwrap();
        assert_eq!(reloaded.root().fingerprint(), ca.root().fingerprint());
    }

    #[test]
    fn test_reloaded_root_signs_verifiable_leaves() {
        let (store, ca) = memory_ca();
        let reloaded = CertificateAuthority::ensure(store).unwrap();

        let leaf = reloaded.issue_leaf(&hosts(&["example.com"])).unwrap();
        assert!(verify::verify_issued_by(leaf.cert_der(), ca.root().cert_der()));
    }

    #[test]
    fn test_ensure_replaces_corrupt_root() {
        let store = Arc::new(MemoryStore::new());
        store.set(store::PRIVATE_KEY, b"not a key").unwrap();
        store.set(store::CERTIFICATE, b"not a cert").unwrap();

        let ca = CertificateAuthority::ensure(store.clone()).unwrap();
        let stored = store.get(store::CERTIFICATE).unwrap().unwrap();
        assert_eq!(stored, ca.root().cert_der().to_vec());
    }

    #[test]
    fn test_ensure_replaces_mismatched_key() {
        let first = RootIdentity::generate().unwrap();
        let second = RootIdentity::generate().unwrap();

        let store = Arc::new(MemoryStore::new());
        store.set(store::PRIVATE_KEY, second.key_der()).unwrap();
        store.set(store::CERTIFICATE, first.cert_der()).unwrap();

        let ca = CertificateAuthority::ensure(store).unwrap();
        assert_ne!(ca.root().fingerprint(), first.fingerprint());
        assert_ne!(ca.root().fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_regenerate_invalidates_old_leaves() {
        let (store, ca) = memory_ca();
        let old_root = ca.root();
        let old_leaf = ca.issue_leaf(&hosts(&["example.com"])).unwrap();

        let new_root = ca.regenerate_root().unwrap();
        assert_ne!(new_root.fingerprint(), old_root.fingerprint());
        assert!(!verify::verify_issued_by(old_leaf.cert_der(), new_root.cert_der()));

        let new_leaf = ca.issue_leaf(&hosts(&["example.com"])).unwrap();
        assert!(verify::verify_issued_by(new_leaf.cert_der(), new_root.cert_der()));

        let stored = store.get(store::CERTIFICATE).unwrap().unwrap();
        assert_eq!(stored, new_root.cert_der().to_vec());
    }

    #[test]
    fn test_set_root_swaps_and_persists() {
        let (store, ca) = memory_ca();
        let replacement = RootIdentity::generate().unwrap();
        let fingerprint = replacement.fingerprint().to_string();

        ca.set_root(replacement).unwrap();
        assert_eq!(ca.root().fingerprint(), fingerprint);

        let reloaded = CertificateAuthority::ensure(store).unwrap();
        assert_eq!(reloaded.root().fingerprint(), fingerprint);
    }

    #[test]
    fn test_failed_key_write_keeps_previous_root() {
        let store = Arc::new(KeyWriteFails::default());
        let ca = CertificateAuthority::ensure(store.clone()).unwrap();
        let original = ca.root().fingerprint().to_string();

        store.failing.store(true, Ordering::SeqCst);
        assert!(ca.regenerate_root().is_err());
        assert_eq!(ca.root().fingerprint(), original);

        // The stored pair still matches, so a restart loads the same root.
        store.failing.store(false, Ordering::SeqCst);
        let reloaded = CertificateAuthority::ensure(store.clone()).unwrap();
        assert_eq!(reloaded.root().fingerprint(), original);
        assert_eq!(
            store.get(store::CERTIFICATE).unwrap().unwrap(),
            ca.root().cert_der().to_vec()
        );
    }
}
