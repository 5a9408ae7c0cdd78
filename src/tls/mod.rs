//! TLS and certificate management

mod ca;
mod cache;
mod mitm;
pub mod verify;

use rustls::crypto::CryptoProvider;
use std::sync::Arc;

pub use ca::{
    CertificateAuthority, LeafCertificate, RootIdentity, LEAF_VALIDITY_DAYS, ROOT_VALIDITY_DAYS,
};
pub use cache::LeafCache;
pub use mitm::MitmCertificateGenerator;
pub use verify::{TrustProbe, WebPkiTrustProbe};

/// The crypto provider used for every rustls config built by this crate.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}
