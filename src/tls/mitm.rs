//! Server-side TLS configuration for terminated tunnels

use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;

use super::ca::{CertificateAuthority, LeafCertificate};
use super::cache::LeafCache;
use crate::error::{Error, Result};

/// Issues (or reuses) leaves and wraps them in a rustls `ServerConfig`.
pub struct MitmCertificateGenerator {
    ca: Arc<CertificateAuthority>,
    cache: LeafCache,
}

impl std::fmt::Debug for MitmCertificateGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmCertificateGenerator")
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

impl MitmCertificateGenerator {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            cache: LeafCache::default(),
        }
    }

    /// Create with custom cache settings. A capacity of zero falls back to the default.
    pub fn with_cache(ca: Arc<CertificateAuthority>, capacity: usize, ttl: Duration) -> Self {
        Self {
            ca,
            cache: LeafCache::new(capacity, ttl),
        }
    }

    /// Leaf for `hosts` under the active root.
    pub fn leaf_for_hosts(&self, hosts: &[String]) -> Result<Arc<LeafCertificate>> {
        let root = self.ca.root();
        let key = LeafCache::key(root.fingerprint(), hosts);

        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(hosts = ?hosts, "Using cached leaf certificate");
            return Ok(cached);
        }

        tracing::debug!(hosts = ?hosts, "Issuing leaf certificate");
        let leaf = Arc::new(self.ca.issue_leaf(hosts)?);

        // Regeneration may have happened between root() and issue_leaf().
        let key = LeafCache::key(leaf.root_fingerprint(), hosts);
        self.cache.put(key, leaf.clone());
        Ok(leaf)
    }

    /// Server config presenting `[leaf, root]` and offering only HTTP/1.1.
    pub fn server_config_for_hosts(&self, hosts: &[String]) -> Result<ServerConfig> {
        let leaf = self.leaf_for_hosts(hosts)?;

        let mut config = ServerConfig::builder_with_provider(super::crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(format!("Failed to select protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(leaf.chain(), leaf.private_key())
            .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }
}
