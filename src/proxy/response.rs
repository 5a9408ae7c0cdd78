//! Shared HTTP response helpers

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Content type for CA certificate downloads.
pub const CA_CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

/// Serialized `HTTP/1.1` response with an empty body.
///
/// Written straight to the client socket by the negotiator, which never
/// hands the connection to a full HTTP server.
pub fn empty_response(status: StatusCode, close: bool) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    if close {
        out.push_str("Connection: close\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

/// The root certificate as a download.
pub fn certificate_response(body: Vec<u8>) -> Response<Full<Bytes>> {
    let len = body.len();
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CA_CERT_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    resp
}

/// 405 for anything other than GET or HEAD on the certificate listener.
pub fn method_not_allowed() -> Response<Full<Bytes>> {
    let mut resp = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
    resp.headers_mut()
        .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
    resp
}
