//! CONNECT negotiation
//!
//! A connection starts in [`ConnectState::Idle`]. The first request must be
//! `CONNECT host:port`; anything else gets a 405 and the connection is closed.
//! Once the CONNECT request has been fully read the upstream is dialed and the
//! client receives `200` (dial succeeded), `404` (dial failed) or `504` (dial
//! timed out). After a 200 the connection carries opaque bytes only.
//!
//! The CONNECT head must arrive within the negotiator's head timeout. A client
//! that stalls past it is dropped without a response.

use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::io::PrefixedStream;
use super::response::empty_response;
use crate::error::{Error, Result};
use crate::http::{Part, RequestDecoder, RequestHead};

const DEFAULT_CONNECT_PORT: u16 = 443;
const READ_CHUNK: usize = 8 * 1024;

/// Default bound on receiving a complete CONNECT head.
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// The `host:port` named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Host without brackets, even for IPv6 literals.
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an authority-form request target. A missing port means 443.
    pub fn parse(authority: &str) -> Result<Self> {
        let bad = |msg: &str| Error::protocol(format!("Invalid CONNECT target '{}': {}", authority, msg));

        if authority.is_empty() || authority.contains('/') {
            return Err(bad("expected host:port"));
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| bad("unclosed '['"))?;
            host.parse::<Ipv6Addr>()
                .map_err(|_| bad("invalid IPv6 address"))?;
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(|| bad("junk after ']'"))?),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((h, _)) if h.contains(':') => return Err(bad("IPv6 literal must be bracketed")),
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(bad("empty host"));
        }
        let port = match port {
            None => DEFAULT_CONNECT_PORT,
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(bad("invalid port")),
                Ok(n) => n,
            },
        };

        Ok(Self::new(host, port))
    }

    /// The authority a client would put in `Host` for this target.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == DEFAULT_CONNECT_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// What the driver should do after feeding a part to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Keep reading.
    Continue,
    /// Send an empty response with this status and close.
    Reject(StatusCode),
    /// Close without a response.
    Close,
    /// The CONNECT request is complete; dial the target.
    Dial(ConnectTarget),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    Idle,
    AwaitingEnd(ConnectTarget),
    Established(ConnectTarget),
    Closed,
}

impl ConnectState {
    pub fn on_part(&mut self, part: Part<RequestHead>) -> Action {
        match (std::mem::take(self), part) {
            (ConnectState::Idle, Part::Head(head)) => {
                if !head.method.eq_ignore_ascii_case("CONNECT") {
                    tracing::debug!(method = %head.method, target = %head.target, "Rejecting non-CONNECT request");
                    *self = ConnectState::Closed;
                    return Action::Reject(StatusCode::METHOD_NOT_ALLOWED);
                }
                match ConnectTarget::parse(&head.target) {
                    Ok(target) => {
                        *self = ConnectState::AwaitingEnd(target);
                        Action::Continue
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Malformed CONNECT request");
                        *self = ConnectState::Closed;
                        Action::Close
                    }
                }
            }
            (ConnectState::AwaitingEnd(target), Part::Body(_)) => {
                *self = ConnectState::AwaitingEnd(target);
                Action::Continue
            }
            (ConnectState::AwaitingEnd(target), Part::End) => {
                *self = ConnectState::AwaitingEnd(target.clone());
                Action::Dial(target)
            }
            (state @ ConnectState::Established(_), _) => {
                *self = state;
                Action::Continue
            }
            (_, _) => {
                *self = ConnectState::Closed;
                Action::Close
            }
        }
    }

    /// Mark the tunnel as up after the 200 has been written.
    pub fn establish(&mut self) {
        if let ConnectState::AwaitingEnd(target) = std::mem::take(self) {
            *self = ConnectState::Established(target);
        } else {
            *self = ConnectState::Closed;
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, ConnectState::Established(_))
    }
}

/// Why the upstream could not be reached.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl DialError {
    /// Status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            DialError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            DialError::Io(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// Opens the TCP connection behind a tunnel.
#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}

/// TCP dialer with a bounded connect time.
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
    connect_timeout: Duration,
    host_override: Option<String>,
    port_override: Option<u16>,
    connector: Arc<dyn Connector>,
}

impl UpstreamDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            host_override: None,
            port_override: None,
            connector: Arc::new(TcpConnector),
        }
    }

    /// Replace the socket connector. The connect timeout still applies.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Dial this host instead of the CONNECT host (for testing).
    pub fn with_host_override(mut self, host: Option<String>) -> Self {
        self.host_override = host;
        self
    }

    /// Dial this port instead of the CONNECT port (for testing).
    pub fn with_port_override(mut self, port: Option<u16>) -> Self {
        self.port_override = port;
        self
    }

    pub async fn dial(&self, target: &ConnectTarget) -> std::result::Result<TcpStream, DialError> {
        let host = self.host_override.as_deref().unwrap_or(&target.host);
        let port = self.port_override.unwrap_or(target.port);
        let stream = with_timeout(self.connect_timeout, self.connector.connect(host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

async fn with_timeout<F, T>(limit: Duration, connect: F) -> std::result::Result<T, DialError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DialError::TimedOut(limit)),
    }
}

/// A tunnel that has been acknowledged with 200.
#[derive(Debug)]
pub struct Negotiated<S> {
    /// Client stream, replaying any bytes sent right after the CONNECT head.
    pub client: PrefixedStream<S>,
    pub upstream: TcpStream,
    pub target: ConnectTarget,
}

#[derive(Debug)]
pub enum Outcome<S> {
    Established(Negotiated<S>),
    /// A response with this status was sent and the connection is done.
    Rejected(StatusCode),
}

/// Drives [`ConnectState`] over a client stream.
#[derive(Debug, Clone)]
pub struct ConnectNegotiator {
    dialer: UpstreamDialer,
    head_timeout: Duration,
}

impl ConnectNegotiator {
    pub fn new(dialer: UpstreamDialer) -> Self {
        Self {
            dialer,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    /// Bound on reading the CONNECT head. The dial is not included.
    pub fn with_head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }

    pub async fn negotiate<S>(&self, mut client: S) -> Result<Outcome<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut decoder = RequestDecoder::new();
        let mut state = ConnectState::Idle;

        let action = tokio::time::timeout(
            self.head_timeout,
            read_head(&mut client, &mut decoder, &mut state),
        )
        .await
        .map_err(|_| {
            Error::protocol(format!(
                "CONNECT head not received within {:?}",
                self.head_timeout
            ))
        })??;

        match action {
            Action::Reject(status) => {
                reject(&mut client, status).await?;
                Ok(Outcome::Rejected(status))
            }
            Action::Dial(target) => {
                let early = decoder.take_buffered();
                self.dial(client, &mut state, target, early).await
            }
            Action::Continue | Action::Close => Err(Error::protocol("malformed CONNECT target")),
        }
    }

    async fn dial<S>(
        &self,
        mut client: S,
        state: &mut ConnectState,
        target: ConnectTarget,
        early: Bytes,
    ) -> Result<Outcome<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.dialer.dial(&target).await {
            Ok(upstream) => {
                client.write_all(&empty_response(StatusCode::OK, false)).await?;
                client.flush().await?;
                state.establish();
                tracing::debug!(target = %target, "Tunnel established");
                Ok(Outcome::Established(Negotiated {
                    client: PrefixedStream::new(early, client),
                    upstream,
                    target,
                }))
            }
            Err(e) => {
                let status = e.status();
                tracing::debug!(target = %target, error = %e, status = status.as_u16(), "Upstream dial failed");
                reject(&mut client, status).await?;
                Ok(Outcome::Rejected(status))
            }
        }
    }
}

/// Read until the state machine asks for a dial or a rejection.
async fn read_head<S>(
    client: &mut S,
    decoder: &mut RequestDecoder,
    state: &mut ConnectState,
) -> Result<Action>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::protocol("client closed before CONNECT completed"));
        }
        decoder.feed(&buf[..n]);

        while let Some(part) = decoder
            .next_part()
            .map_err(|e| Error::protocol(format!("Malformed request: {}", e)))?
        {
            match state.on_part(part) {
                Action::Continue => {}
                Action::Close => return Err(Error::protocol("malformed CONNECT target")),
                action => return Ok(action),
            }
        }
    }
}

async fn reject<S: AsyncWrite + Unpin>(client: &mut S, status: StatusCode) -> io::Result<()> {
    client.write_all(&empty_response(status, true)).await?;
    client.flush().await?;
    client.shutdown().await
}
