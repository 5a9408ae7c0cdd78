//! Capture and notification collaborators
//!
//! Both are called off the connection's hot path through [`Dispatcher`], so a
//! slow sink delays other side effects but never the relayed bytes.

mod capture;
mod dispatch;
mod notify;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::http::body;
use crate::http::CapturedExchange;

pub use capture::{JsonlCaptureStore, TracingCaptureSink};
pub use dispatch::{Dispatch, Dispatcher};
pub use notify::TracingNotifier;

/// Durable storage for finalized exchanges.
#[async_trait]
pub trait CaptureSink: Send + Sync {
    async fn save(&self, exchange: &CapturedExchange) -> Result<()>;
}

/// Delivery of user-facing alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Metadata key holding the base64 JSON object of request headers.
pub const META_HEADERS: &str = "headers";
/// Metadata key holding the base64 raw response body.
pub const META_BODY: &str = "body";
/// Metadata key holding the request path.
pub const META_PATH: &str = "path";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

impl Notification {
    pub fn for_exchange(exchange: &CapturedExchange) -> Self {
        let path = exchange.request_path().to_string();
        let mut metadata = BTreeMap::new();
        metadata.insert(
            META_HEADERS.to_string(),
            body::headers_base64(&exchange.request_headers),
        );
        metadata.insert(
            META_BODY.to_string(),
            body::base64_encode(&exchange.response_body),
        );
        metadata.insert(META_PATH.to_string(), path.clone());

        Self {
            title: format!("Captured {} {}", exchange.method, path),
            body: exchange.host.clone(),
            metadata,
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.metadata.get(META_PATH).map(String::as_str)
    }
}
