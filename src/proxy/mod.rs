//! Connection handling: CONNECT negotiation, relaying and interception

mod cert_server;
pub mod connect;
mod intercept;
mod io;
mod relay;
pub mod response;
mod server;
mod tunnel;

pub use cert_server::CertificateServer;
pub use connect::{ConnectNegotiator, ConnectState, ConnectTarget, Negotiated, Outcome, UpstreamDialer};
pub use intercept::InterceptionPipeline;
pub use io::PrefixedStream;
pub use relay::{DuplexRelay, Opaque, RelayObserver, RelayStats};
pub use server::{BoundAddresses, ProxyServer};
pub use tunnel::{default_upstream_tls, leaf_hosts, upstream_tls_with_roots, TunnelHandler};
