//! Tapwire - A TLS-intercepting CONNECT proxy
//!
//! Clients reach HTTPS hosts through `CONNECT`. Tunnels to configured target
//! hosts are terminated with leaf certificates forged on demand by a local
//! root; their HTTP/1.x exchanges are paired and handed to capture and
//! notification sinks. Every other tunnel is relayed byte for byte.
//!
//! # Features
//!
//! - **Local certificate authority**: a persisted P-256 root that issues per-host leaves
//! - **CONNECT negotiation**: 405 for other methods, 404/504 for unreachable upstreams
//! - **Duplex relay**: half-close aware and back-pressured in both directions
//! - **Exchange capture**: FIFO request/response pairing with per-path capture and notify rules
//!
//! # Example
//!
//! ```no_run
//! use tapwire::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("tapwire.toml")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod rules;
pub mod sink;
pub mod store;
pub mod tls;

pub use config::{Config, InterceptMode};
pub use error::{Error, Result};
pub use http::CapturedExchange;
pub use proxy::{BoundAddresses, ProxyServer};
pub use rules::{ProxyPath, ProxyTarget, RuleSet};
pub use sink::{CaptureSink, Notification, Notifier};
pub use store::{CredentialStore, FileStore, MemoryStore};
pub use tls::{CertificateAuthority, LeafCertificate, MitmCertificateGenerator, RootIdentity};
