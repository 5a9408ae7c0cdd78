//! Plain HTTP listener serving the root certificate

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::response::{certificate_response, method_not_allowed};
use crate::error::{Error, Result};
use crate::tls::CertificateAuthority;

/// Answers every GET with the active root: PEM by default, DER when the
/// path ends in `.der`.
#[derive(Debug, Clone)]
pub struct CertificateServer {
    ca: Arc<CertificateAuthority>,
}

impl CertificateServer {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self { ca }
    }

    pub fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if *method != Method::GET && *method != Method::HEAD {
            return method_not_allowed();
        }

        let root = self.ca.root();
        let body = if path.ends_with(".der") {
            root.cert_der().to_vec()
        } else {
            root.cert_pem().into_bytes()
        };
        certificate_response(body)
    }

    pub async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let this = self.clone();
        let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
            let resp = this.respond(req.method(), req.uri().path());
            async move { Ok::<_, Infallible>(resp) }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(Error::from)
    }
}
