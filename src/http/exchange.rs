//! Request/response pairing for one intercepted connection

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::VecDeque;

use super::body::{self, serialize_base64};
use super::codec::{DecodeError, Header, Part, RequestDecoder, RequestHead, ResponseDecoder, ResponseHead};

/// A finalized request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedExchange {
    pub started_at: String,
    pub completed_at: String,
    pub method: String,
    /// Request target as sent by the client, query included.
    pub path: String,
    pub host: String,
    pub request_headers: Vec<Header>,
    #[serde(serialize_with = "serialize_base64")]
    pub request_body: Bytes,
    pub status: u16,
    pub reason: String,
    pub response_headers: Vec<Header>,
    #[serde(serialize_with = "serialize_base64")]
    pub response_body: Bytes,
    /// Set when either body outgrew the accumulator cap.
    pub truncated: bool,
}

impl CapturedExchange {
    /// Request path with any query string removed.
    pub fn request_path(&self) -> &str {
        request_path(&self.path)
    }

    /// Request body with its content coding removed.
    pub fn request_body_decoded(&self) -> Option<Vec<u8>> {
        body::decode_body(&self.request_headers, &self.request_body)
    }

    /// Response body with its content coding removed.
    pub fn response_body_decoded(&self) -> Option<Vec<u8>> {
        body::decode_body(&self.response_headers, &self.response_body)
    }

    /// Response body as key-sorted JSON, if it decodes and parses.
    pub fn response_json(&self) -> Option<String> {
        body::canonical_json(&self.response_body_decoded()?)
    }

    pub fn request_json(&self) -> Option<String> {
        body::canonical_json(&self.request_body_decoded()?)
    }
}

/// Path portion of a request target.
///
/// Origin-form targets lose their query; absolute-form targets also lose
/// scheme and authority.
pub fn request_path(target: &str) -> &str {
    let without_scheme = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"));
    let path = match without_scheme {
        Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => target,
    };
    path.split(['?', '#']).next().unwrap_or(path)
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[derive(Debug)]
struct PendingExchange {
    started_at: String,
    request: RequestHead,
    host: String,
    request_body: BytesMut,
    response: Option<ResponseHead>,
    response_body: BytesMut,
    truncated: bool,
}

impl PendingExchange {
    fn finalize(self) -> Option<CapturedExchange> {
        let response = self.response?;
        Some(CapturedExchange {
            started_at: self.started_at,
            completed_at: now_rfc3339(),
            method: self.request.method,
            path: self.request.target,
            host: self.host,
            request_headers: self.request.headers,
            request_body: self.request_body.freeze(),
            status: response.status,
            reason: response.reason,
            response_headers: response.headers,
            response_body: self.response_body.freeze(),
            truncated: self.truncated,
        })
    }
}

fn append_capped(buf: &mut BytesMut, data: &[u8], cap: usize, truncated: &mut bool) {
    let room = cap.saturating_sub(buf.len());
    if data.len() > room {
        *truncated = true;
    }
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

/// FIFO of in-flight exchanges for one connection.
///
/// Request parts go to the most recently pushed exchange. Response parts go
/// to the oldest, which is always the one still lacking a response because
/// completed exchanges are popped immediately.
#[derive(Debug)]
pub struct ExchangeQueue {
    pending: VecDeque<PendingExchange>,
    max_body_bytes: usize,
    reading_request: bool,
    /// The request being read was popped by an early response.
    request_orphaned: bool,
}

impl ExchangeQueue {
    pub fn new(max_body_bytes: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_body_bytes,
            reading_request: false,
            request_orphaned: false,
        }
    }

    pub fn push_request(&mut self, request: RequestHead, host: String) {
        self.pending.push_back(PendingExchange {
            started_at: now_rfc3339(),
            request,
            host,
            request_body: BytesMut::new(),
            response: None,
            response_body: BytesMut::new(),
            truncated: false,
        });
        self.reading_request = true;
        self.request_orphaned = false;
    }

    pub fn append_request_body(&mut self, data: &[u8]) {
        if self.request_orphaned {
            return;
        }
        let cap = self.max_body_bytes;
        if let Some(last) = self.pending.back_mut() {
            append_capped(&mut last.request_body, data, cap, &mut last.truncated);
        }
    }

    pub fn end_request(&mut self) {
        self.reading_request = false;
        self.request_orphaned = false;
    }

    /// Attach a response head to the oldest exchange. Returns false when no
    /// request is waiting.
    pub fn attach_response(&mut self, head: ResponseHead) -> bool {
        match self.pending.front_mut() {
            Some(first) => {
                first.response = Some(head);
                true
            }
            None => false,
        }
    }

    pub fn append_response_body(&mut self, data: &[u8]) {
        let cap = self.max_body_bytes;
        if let Some(first) = self.pending.front_mut() {
            if first.response.is_some() {
                append_capped(&mut first.response_body, data, cap, &mut first.truncated);
            }
        }
    }

    /// Pop the oldest exchange if it has a response.
    pub fn complete_response(&mut self) -> Option<CapturedExchange> {
        if self.pending.front()?.response.is_none() {
            return None;
        }
        let exchange = self.pending.pop_front()?;
        if self.pending.is_empty() && self.reading_request {
            self.request_orphaned = true;
        }
        exchange.finalize()
    }

    /// Method of the oldest exchange, which determines response framing.
    pub fn front_method(&self) -> Option<&str> {
        self.pending.front().map(|e| e.request.method.as_str())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Observing,
    Stopped,
}

/// Decodes both directions of a plaintext session and yields finalized exchanges.
#[derive(Debug)]
pub struct ExchangeTracker {
    requests: RequestDecoder,
    responses: ResponseDecoder,
    queue: ExchangeQueue,
    default_host: String,
    request_side: Direction,
    response_side: Direction,
    in_interim: bool,
}

impl ExchangeTracker {
    pub fn new(max_body_bytes: usize) -> Self {
        Self {
            requests: RequestDecoder::new(),
            responses: ResponseDecoder::new(),
            queue: ExchangeQueue::new(max_body_bytes),
            default_host: String::new(),
            request_side: Direction::Observing,
            response_side: Direction::Observing,
            in_interim: false,
        }
    }

    /// Host recorded for requests that carry no `Host` header.
    pub fn with_default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = host.into();
        self
    }

    pub fn observe_request(&mut self, data: &[u8]) {
        if self.request_side == Direction::Stopped {
            return;
        }
        self.requests.feed(data);

        loop {
            match self.requests.next_part() {
                Ok(Some(Part::Head(head))) => {
                    let host = head
                        .host()
                        .map(str::to_string)
                        .unwrap_or_else(|| self.default_host.clone());
                    self.queue.push_request(head, host);
                }
                Ok(Some(Part::Body(chunk))) => self.queue.append_request_body(&chunk),
                Ok(Some(Part::End)) => self.queue.end_request(),
                Ok(None) => break,
                Err(e) => {
                    self.stop("request", &e);
                    break;
                }
            }
        }
    }

    pub fn observe_response(&mut self, data: &[u8]) -> Vec<CapturedExchange> {
        let mut completed = Vec::new();
        if self.response_side == Direction::Stopped {
            return completed;
        }
        self.responses.feed(data);

        loop {
            match self.responses.next_part(self.queue.front_method()) {
                Ok(Some(Part::Head(head))) => {
                    if head.is_interim() {
                        self.in_interim = true;
                    } else if !self.queue.attach_response(head) {
                        tracing::debug!("Response without a pending request, stopping observation");
                        self.stop_all();
                        break;
                    }
                }
                Ok(Some(Part::Body(chunk))) => self.queue.append_response_body(&chunk),
                Ok(Some(Part::End)) => {
                    if self.in_interim {
                        self.in_interim = false;
                        continue;
                    }
                    completed.extend(self.queue.complete_response());
                    if self.responses.is_upgraded() {
                        self.stop_all();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.stop("response", &e);
                    break;
                }
            }
        }
        completed
    }

    /// Upstream finished sending. Completes a close-delimited final response.
    pub fn observe_response_eof(&mut self) -> Vec<CapturedExchange> {
        if self.response_side == Direction::Stopped {
            return Vec::new();
        }
        match self.responses.finish() {
            Some(Part::End) => self.queue.complete_response().into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// True once the session is no longer parsed as HTTP.
    pub fn is_passthrough(&self) -> bool {
        self.request_side == Direction::Stopped && self.response_side == Direction::Stopped
    }

    /// Exchanges still waiting for a complete response.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn stop(&mut self, side: &str, error: &DecodeError) {
        tracing::debug!(side = side, error = %error, "Stopped decoding intercepted traffic");
        self.stop_all();
    }

    fn stop_all(&mut self) {
        self.request_side = Direction::Stopped;
        self.response_side = Direction::Stopped;
    }
}
