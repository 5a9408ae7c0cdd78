//! Shared test infrastructure for tapwire integration tests.
//!
//! Provides helpers for spinning up TLS upstream servers, proxy instances,
//! recording sinks, and raw CONNECT clients.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tapwire::http::{Part, ResponseDecoder, ResponseHead};
use tapwire::proxy::upstream_tls_with_roots;
use tapwire::tls::crypto_provider;
use tapwire::{
    CaptureSink, CapturedExchange, CertificateAuthority, Config, MemoryStore, Notification,
    Notifier, ProxyServer, ProxyTarget, RootIdentity,
};

pub const TARGET_HOST: &str = "api.example.com";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the process-wide rustls provider. reqwest pulls in a second one,
/// so helpers that build configs without an explicit provider need this.
pub fn install_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

// ---------------------------------------------------------------------------
// UpstreamCa: independent root that signs the upstream server's certificate
// ---------------------------------------------------------------------------

pub struct UpstreamCa {
    root: RootIdentity,
}

impl UpstreamCa {
    pub fn generate() -> Self {
        Self {
            root: RootIdentity::generate().unwrap(),
        }
    }

    /// Server config presenting a leaf for `host`, HTTP/1.1 only.
    pub fn server_config(&self, host: &str) -> ServerConfig {
        let leaf = self.root.issue_leaf(&[host.to_string()]).unwrap();
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(leaf.chain(), leaf.private_key())
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }

    /// Client config the proxy uses to reach the upstream.
    pub fn proxy_upstream_tls(&self) -> Arc<ClientConfig> {
        Arc::new(upstream_tls_with_roots(roots_for(self.root.cert_der())).unwrap())
    }
}

pub fn roots_for(cert: &CertificateDer<'static>) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(cert.clone()).unwrap();
    roots
}

// ---------------------------------------------------------------------------
// TestUpstream: TLS HTTP/1.1 server on a random port
// ---------------------------------------------------------------------------

pub struct TestUpstream {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestUpstream {
    /// Start an upstream that answers through `echo_service`.
    pub async fn start(ca: &UpstreamCa, host: &str) -> Self {
        let acceptor = TlsAcceptor::from(Arc::new(ca.server_config(host)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let Ok(tls) = acceptor.accept(stream).await else { return };
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(tls), service_fn(echo_service))
                                .await;
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Responds with `"{METHOD} {path} {request body}"`. `/gzip` answers with a
/// gzip-encoded JSON document instead.
async fn echo_service(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    if parts.uri.path() == "/gzip" {
        return Ok(Response::builder()
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .body(Full::new(Bytes::from(gzip(br#"{"b":2,"a":1}"#))))
            .unwrap());
    }

    let text = format!(
        "{} {} {}",
        parts.method,
        parts.uri.path(),
        String::from_utf8_lossy(&body)
    );
    Ok(Response::builder()
        .header("X-Upstream", "test")
        .body(Full::new(Bytes::from(text)))
        .unwrap())
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

// ---------------------------------------------------------------------------
// TcpEcho: plain TCP echo server for opaque tunnels
// ---------------------------------------------------------------------------

pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ---------------------------------------------------------------------------
// Recording sinks
// ---------------------------------------------------------------------------

pub struct RecordingCapture(mpsc::UnboundedSender<CapturedExchange>);

#[async_trait::async_trait]
impl CaptureSink for RecordingCapture {
    async fn save(&self, exchange: &CapturedExchange) -> tapwire::Result<()> {
        let _ = self.0.send(exchange.clone());
        Ok(())
    }
}

pub struct RecordingNotifier(mpsc::UnboundedSender<Notification>);

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notification: &Notification) -> tapwire::Result<()> {
        let _ = self.0.send(notification.clone());
        Ok(())
    }
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for side effect")
        .expect("sink channel closed")
}

/// Asserts nothing else arrives within a short grace period.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(extra)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected side effect: {:?}", extra);
    }
}

// ---------------------------------------------------------------------------
// TestProxy: tapwire on random ports with recording sinks
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub addr: SocketAddr,
    pub cert_addr: SocketAddr,
    pub ca: Arc<CertificateAuthority>,
    pub captures: mpsc::UnboundedReceiver<CapturedExchange>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    /// Start a proxy whose upstream dials all land on `127.0.0.1:upstream_port`.
    pub async fn start(
        targets: Vec<ProxyTarget>,
        upstream_port: u16,
        upstream_tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        let mut config = Config::minimal("127.0.0.1:0".to_string(), "127.0.0.1:0".to_string());
        config.targets = targets;

        let ca = Arc::new(CertificateAuthority::ensure(Arc::new(MemoryStore::new())).unwrap());
        let (capture_tx, captures) = mpsc::unbounded_channel();
        let (notify_tx, notifications) = mpsc::unbounded_channel();

        let mut server = ProxyServer::with_components(
            config,
            ca.clone(),
            Arc::new(RecordingCapture(capture_tx)),
            Arc::new(RecordingNotifier(notify_tx)),
        )
        .unwrap()
        .with_upstream_host_override("127.0.0.1".to_string())
        .with_upstream_port_override(upstream_port);
        if let Some(tls) = upstream_tls {
            server = server.with_upstream_tls(tls);
        }

        let addresses = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self {
            addr: addresses.proxy,
            cert_addr: addresses.certificate,
            ca,
            captures,
            notifications,
            shutdown_tx,
        }
    }

    /// Client config trusting this proxy's current root.
    pub fn client_tls(&self) -> Arc<ClientConfig> {
        client_tls_trusting(self.ca.root().cert_der())
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub fn client_tls_trusting(root: &CertificateDer<'static>) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots_for(root))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

/// Read bytes up to and including the blank line ending a response head.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Send `CONNECT authority` and return the stream with the proxy's reply head.
pub async fn connect(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        authority, authority
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Establish a CONNECT tunnel and complete TLS inside it.
pub async fn open_tls_tunnel(
    proxy: &TestProxy,
    authority: &str,
    sni: &str,
) -> TlsStream<TcpStream> {
    let (stream, head) = connect(proxy.addr, authority).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply: {}", head);

    let server_name = ServerName::try_from(sni.to_string()).unwrap();
    TlsConnector::from(proxy.client_tls())
        .connect(server_name, stream)
        .await
        .unwrap()
}

/// Reads successive responses off one connection.
pub struct ResponseReader {
    decoder: ResponseDecoder,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self {
            decoder: ResponseDecoder::new(),
        }
    }

    pub async fn next<S>(&mut self, stream: &mut S, method: &str) -> (ResponseHead, Vec<u8>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut head = None;
        let mut body = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            while let Some(part) = self.decoder.next_part(Some(method)).unwrap() {
                match part {
                    Part::Head(h) => head = Some(h),
                    Part::Body(data) => body.extend_from_slice(&data),
                    Part::End => return (head.expect("end before head"), body),
                }
            }
            let n = tokio::time::timeout(RECV_TIMEOUT, stream.read(&mut buf))
                .await
                .expect("timed out reading response")
                .unwrap();
            assert!(n > 0, "connection closed mid-response");
            self.decoder.feed(&buf[..n]);
        }
    }
}
