mod common;

use common::{
    assert_quiet, client_tls_trusting, closed_port, connect, open_tls_tunnel, recv,
    start_tcp_echo, ResponseReader, TestProxy, TestUpstream, UpstreamCa, TARGET_HOST,
};
use rustls::pki_types::ServerName;
use tapwire::tls::verify::{subject_alt_names, verify_issued_by};
use tapwire::{ProxyPath, ProxyTarget};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

async fn intercepting_proxy(target: ProxyTarget) -> (TestProxy, TestUpstream) {
    let upstream_ca = UpstreamCa::generate();
    let upstream = TestUpstream::start(&upstream_ca, TARGET_HOST).await;
    let proxy = TestProxy::start(
        vec![target],
        upstream.port(),
        Some(upstream_ca.proxy_upstream_tls()),
    )
    .await;
    (proxy, upstream)
}

/// CONNECT to a target host, forged certificate, one notification for the
/// listed path.
#[tokio::test]
async fn test_connect_intercept_and_notify() {
    let target = ProxyTarget::new(TARGET_HOST).with_path(ProxyPath::new("/foo"));
    let (mut proxy, upstream) = intercepting_proxy(target).await;

    let (stream, head) = connect(proxy.addr, "api.example.com:443").await;
    assert_eq!(head, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

    let server_name = ServerName::try_from(TARGET_HOST).unwrap();
    let mut tls = TlsConnector::from(proxy.client_tls())
        .connect(server_name, stream)
        .await
        .unwrap();

    let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
    assert_eq!(subject_alt_names(&leaf).unwrap(), vec![TARGET_HOST]);
    assert!(verify_issued_by(&leaf, proxy.ca.root().cert_der()));

    tls.write_all(b"GET /foo HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = ResponseReader::new().next(&mut tls, "GET").await;
    assert_eq!(head.status, 200);
    assert_eq!(head.header("x-upstream"), Some("test"));
    assert_eq!(body, b"GET /foo ");

    let notification = recv(&mut proxy.notifications).await;
    assert_eq!(notification.path(), Some("/foo"));
    assert_eq!(notification.title, "Captured GET /foo");
    assert_eq!(notification.body, TARGET_HOST);
    assert_quiet(&mut proxy.notifications).await;

    let captured = recv(&mut proxy.captures).await;
    assert_eq!(captured.method, "GET");
    assert_eq!(captured.request_path(), "/foo");
    assert_eq!(captured.status, 200);
    assert_eq!(&captured.response_body[..], b"GET /foo ");

    proxy.shutdown();
    upstream.shutdown();
}

#[tokio::test]
async fn test_unlisted_path_captured_without_notification() {
    let target = ProxyTarget::new(TARGET_HOST).with_path(ProxyPath::new("/foo"));
    let (mut proxy, upstream) = intercepting_proxy(target).await;

    let mut tls = open_tls_tunnel(&proxy, "api.example.com:443", TARGET_HOST).await;
    tls.write_all(b"GET /bar?x=1 HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = ResponseReader::new().next(&mut tls, "GET").await;
    assert_eq!(head.status, 200);

    let captured = recv(&mut proxy.captures).await;
    assert_eq!(captured.path, "/bar?x=1");
    assert_eq!(captured.request_path(), "/bar");
    assert_quiet(&mut proxy.notifications).await;

    proxy.shutdown();
    upstream.shutdown();
}

/// Several requests in one write come back as correctly paired exchanges.
#[tokio::test]
async fn test_pipelined_requests_paired() {
    let target = ProxyTarget::new(TARGET_HOST).with_notify(false);
    let (mut proxy, upstream) = intercepting_proxy(target).await;

    let mut tls = open_tls_tunnel(&proxy, "api.example.com:443", TARGET_HOST).await;
    tls.write_all(
        b"GET /a HTTP/1.1\r\nHost: api.example.com\r\n\r\n\
          POST /b HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: 5\r\n\r\nhello\
          GET /c HTTP/1.1\r\nHost: api.example.com\r\n\r\n",
    )
    .await
    .unwrap();

    let mut reader = ResponseReader::new();
    let (_, a) = reader.next(&mut tls, "GET").await;
    let (_, b) = reader.next(&mut tls, "POST").await;
    let (_, c) = reader.next(&mut tls, "GET").await;
    assert_eq!(a, b"GET /a ");
    assert_eq!(b, b"POST /b hello");
    assert_eq!(c, b"GET /c ");

    let mut seen = Vec::new();
    for _ in 0..3 {
        let captured = recv(&mut proxy.captures).await;
        seen.push((
            captured.method.clone(),
            captured.path.clone(),
            captured.request_body.clone(),
            captured.response_body.clone(),
        ));
    }
    // Side effects run concurrently, so arrival order is not meaningful.
    seen.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(seen[0].0, "GET");
    assert_eq!(seen[0].1, "/a");
    assert_eq!(seen[1].0, "POST");
    assert_eq!(seen[1].1, "/b");
    assert_eq!(&seen[1].2[..], b"hello");
    assert_eq!(&seen[1].3[..], b"POST /b hello");
    assert_eq!(seen[2].1, "/c");
    assert_quiet(&mut proxy.notifications).await;

    proxy.shutdown();
    upstream.shutdown();
}

#[tokio::test]
async fn test_gzip_response_decoded_for_capture() {
    let target = ProxyTarget::new(TARGET_HOST).with_notify(false);
    let (mut proxy, upstream) = intercepting_proxy(target).await;

    let mut tls = open_tls_tunnel(&proxy, "api.example.com:443", TARGET_HOST).await;
    tls.write_all(b"GET /gzip HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = ResponseReader::new().next(&mut tls, "GET").await;
    assert_eq!(head.header("content-encoding"), Some("gzip"));
    // The client sees the upstream bytes untouched.
    assert_eq!(body, common::gzip(br#"{"b":2,"a":1}"#));

    let captured = recv(&mut proxy.captures).await;
    assert_eq!(
        captured.response_body_decoded().unwrap(),
        br#"{"b":2,"a":1}"#
    );
    assert_eq!(captured.response_json().unwrap(), r#"{"a":1,"b":2}"#);

    proxy.shutdown();
    upstream.shutdown();
}

#[tokio::test]
async fn test_non_connect_request_rejected_with_405() {
    let proxy = TestProxy::start(vec![], closed_port().await, None).await;

    let mut stream = tokio::net::TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"GET http://api.example.com/ HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
        .await
        .unwrap();
    let head = common::read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{}", head);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    proxy.shutdown();
}

#[tokio::test]
async fn test_unreachable_upstream_returns_404() {
    let proxy = TestProxy::start(vec![], closed_port().await, None).await;

    let (mut stream, head) = connect(proxy.addr, "api.example.com:443").await;
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", head);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    proxy.shutdown();
}

/// Tunnels to hosts without a target are relayed byte for byte.
#[tokio::test]
async fn test_non_target_host_relayed_opaquely() {
    let echo = start_tcp_echo().await;
    let target = ProxyTarget::new(TARGET_HOST);
    let mut proxy = TestProxy::start(vec![target], echo.port(), None).await;

    let (mut stream, head) = connect(proxy.addr, "other.example.com:443").await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);

    // Not TLS, so an intercepting proxy would choke on it.
    stream.write_all(b"plain bytes\x00\xff").await.unwrap();
    let mut echoed = [0u8; 13];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"plain bytes\x00\xff");

    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert_quiet(&mut proxy.captures).await;
    proxy.shutdown();
}

/// Leaves forged before a regeneration stop verifying against the new root.
#[tokio::test]
async fn test_regenerated_root_replaces_forged_leaves() {
    let target = ProxyTarget::new(TARGET_HOST);
    let (proxy, upstream) = intercepting_proxy(target).await;
    let old_root = proxy.ca.root().cert_der().clone();

    let tls = open_tls_tunnel(&proxy, "api.example.com:443", TARGET_HOST).await;
    drop(tls);

    proxy.ca.regenerate_root().unwrap();

    // A client still trusting the old root is refused.
    let (stream, head) = connect(proxy.addr, "api.example.com:443").await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let result = TlsConnector::from(client_tls_trusting(&old_root))
        .connect(ServerName::try_from(TARGET_HOST).unwrap(), stream)
        .await;
    assert!(result.is_err());

    // One trusting the new root gets a leaf issued by it.
    let tls = open_tls_tunnel(&proxy, "api.example.com:443", TARGET_HOST).await;
    let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
    assert!(verify_issued_by(&leaf, proxy.ca.root().cert_der()));
    assert!(!verify_issued_by(&leaf, &old_root));

    proxy.shutdown();
    upstream.shutdown();
}
