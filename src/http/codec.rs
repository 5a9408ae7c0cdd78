//! Incremental HTTP/1.x message framing
//!
//! The decoders here never touch a socket. Bytes are fed in as they arrive
//! and come back out as a sequence of [`Part`]s: one head, zero or more body
//! chunks (de-chunked), and an end marker. Keep-alive connections simply
//! produce the next head after an end.

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// Framing failures. Any of these ends observation of the stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message head: {0}")]
    Head(#[from] httparse::Error),

    #[error("message head exceeds 64 KiB")]
    HeadTooLarge,

    #[error("invalid content-length: {0}")]
    ContentLength(String),

    #[error("unsupported transfer-encoding in request: {0}")]
    TransferEncoding(String),

    #[error("invalid chunk size line")]
    ChunkSize,

    #[error("chunk data not followed by CRLF")]
    ChunkDelimiter,
}

/// A single header field, kept in wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Case-insensitive lookup of the first header named `name`.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as sent (origin-form, absolute-form or authority-form).
    pub target: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// 1xx other than 101: forwarded, but followed by the real response.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }
}

/// One step of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part<H> {
    Head(H),
    Body(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(u64),
    Chunked(Chunk),
    UntilClose,
    /// Message fully framed, `End` not yet emitted.
    Finished,
    /// After a 101 response. Nothing more is HTTP.
    Upgraded,
}

#[derive(Debug)]
struct Framer {
    buf: BytesMut,
    state: State,
}

impl Framer {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::Head,
        }
    }

    fn start_body(&mut self, framing: Framing) {
        self.state = match framing {
            Framing::Length(0) => State::Finished,
            Framing::Length(n) => State::Length(n),
            Framing::Chunked => State::Chunked(Chunk::Size),
            Framing::UntilClose => State::UntilClose,
        };
    }

    /// Advance through body framing. Returns `None` when more input is needed
    /// or when the state is `Head`/`Upgraded`.
    fn body_part<H>(&mut self, after_end: State) -> Result<Option<Part<H>>, DecodeError> {
        loop {
            match self.state {
                State::Head | State::Upgraded => return Ok(None),
                State::Finished => {
                    self.state = after_end;
                    return Ok(Some(Part::End));
                }
                State::Length(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(self.buf.len() as u64) as usize;
                    let data = self.buf.split_to(n).freeze();
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        State::Finished
                    } else {
                        State::Length(left)
                    };
                    return Ok(Some(Part::Body(data)));
                }
                State::UntilClose => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(Part::Body(self.buf.split().freeze())));
                }
                State::Chunked(chunk) => match chunk {
                    Chunk::Size => {
                        let Some(line) = self.take_line()? else {
                            return Ok(None);
                        };
                        let size = parse_chunk_size(&line)?;
                        self.state = State::Chunked(if size == 0 {
                            Chunk::Trailer
                        } else {
                            Chunk::Data(size)
                        });
                    }
                    Chunk::Data(remaining) => {
                        if self.buf.is_empty() {
                            return Ok(None);
                        }
                        let n = remaining.min(self.buf.len() as u64) as usize;
                        let data = self.buf.split_to(n).freeze();
                        let left = remaining - n as u64;
                        self.state = State::Chunked(if left == 0 {
                            Chunk::DataEnd
                        } else {
                            Chunk::Data(left)
                        });
                        return Ok(Some(Part::Body(data)));
                    }
                    Chunk::DataEnd => {
                        if self.buf.len() < 2 {
                            return Ok(None);
                        }
                        if &self.buf[..2] != b"\r\n" {
                            return Err(DecodeError::ChunkDelimiter);
                        }
                        self.buf.advance(2);
                        self.state = State::Chunked(Chunk::Size);
                    }
                    Chunk::Trailer => {
                        let Some(line) = self.take_line()? else {
                            return Ok(None);
                        };
                        if line.is_empty() {
                            self.state = State::Finished;
                        }
                    }
                },
            }
        }
    }

    /// Remove one CRLF-terminated line (without the terminator).
    fn take_line(&mut self) -> Result<Option<BytesMut>, DecodeError> {
        match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                Ok(Some(line))
            }
            None if self.buf.len() > MAX_CHUNK_LINE => Err(DecodeError::ChunkSize),
            None => Ok(None),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, DecodeError> {
    let line = std::str::from_utf8(line).map_err(|_| DecodeError::ChunkSize)?;
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(DecodeError::ChunkSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| DecodeError::ChunkSize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked,
    UntilClose,
}

fn is_chunked(transfer_encoding: &str) -> bool {
    transfer_encoding
        .rsplit(',')
        .next()
        .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &[Header]) -> Result<Option<u64>, DecodeError> {
    let mut found: Option<u64> = None;
    for header in headers.iter().filter(|h| h.name.eq_ignore_ascii_case("content-length")) {
        for value in header.value.split(',') {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| DecodeError::ContentLength(header.value.clone()))?;
            match found {
                Some(existing) if existing != parsed => {
                    return Err(DecodeError::ContentLength(header.value.clone()));
                }
                _ => found = Some(parsed),
            }
        }
    }
    Ok(found)
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<Header> {
    headers
        .iter()
        .map(|h| Header {
            name: h.name.to_string(),
            value: String::from_utf8_lossy(h.value).into_owned(),
        })
        .collect()
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf)? {
        httparse::Status::Complete(len) => {
            let head = RequestHead {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
                headers: owned_headers(req.headers),
            };
            Ok(Some((head, len)))
        }
        httparse::Status::Partial if buf.len() > MAX_HEAD_BYTES => Err(DecodeError::HeadTooLarge),
        httparse::Status::Partial => Ok(None),
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf)? {
        httparse::Status::Complete(len) => {
            let head = ResponseHead {
                version: resp.version.unwrap_or(1),
                status: resp.code.unwrap_or_default(),
                reason: resp.reason.unwrap_or_default().to_string(),
                headers: owned_headers(resp.headers),
            };
            Ok(Some((head, len)))
        }
        httparse::Status::Partial if buf.len() > MAX_HEAD_BYTES => Err(DecodeError::HeadTooLarge),
        httparse::Status::Partial => Ok(None),
    }
}

/// Decoder for the client-to-server direction.
#[derive(Debug)]
pub struct RequestDecoder {
    framer: Framer,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self {
            framer: Framer::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.framer.buf.extend_from_slice(data);
    }

    pub fn next_part(&mut self) -> Result<Option<Part<RequestHead>>, DecodeError> {
        if self.framer.state != State::Head {
            return self.framer.body_part(State::Head);
        }

        let Some((head, len)) = parse_request_head(&self.framer.buf)? else {
            return Ok(None);
        };
        self.framer.buf.advance(len);

        let framing = match head.header("transfer-encoding") {
            Some(te) if is_chunked(te) => Framing::Chunked,
            Some(te) => return Err(DecodeError::TransferEncoding(te.to_string())),
            None => Framing::Length(content_length(&head.headers)?.unwrap_or(0)),
        };
        self.framer.start_body(framing);
        Ok(Some(Part::Head(head)))
    }

    /// Bytes received but not yet consumed by any emitted part.
    pub fn take_buffered(&mut self) -> Bytes {
        self.framer.buf.split().freeze()
    }
}

/// Decoder for the server-to-client direction.
///
/// Response framing depends on the request it answers, so each call takes
/// the method of the oldest unanswered request.
#[derive(Debug)]
pub struct ResponseDecoder {
    framer: Framer,
    after_end: State,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self {
            framer: Framer::new(),
            after_end: State::Head,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.framer.buf.extend_from_slice(data);
    }

    pub fn next_part(
        &mut self,
        request_method: Option<&str>,
    ) -> Result<Option<Part<ResponseHead>>, DecodeError> {
        if self.framer.state != State::Head {
            return self.framer.body_part(self.after_end);
        }

        let Some((head, len)) = parse_response_head(&self.framer.buf)? else {
            return Ok(None);
        };
        self.framer.buf.advance(len);

        let head_request = request_method
            .map(|m| m.eq_ignore_ascii_case("HEAD"))
            .unwrap_or(false);
        let bodiless = head_request
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304;

        let framing = if bodiless {
            Framing::Length(0)
        } else {
            match head.header("transfer-encoding") {
                Some(te) if is_chunked(te) => Framing::Chunked,
                Some(_) => Framing::UntilClose,
                None => match content_length(&head.headers)? {
                    Some(n) => Framing::Length(n),
                    None => Framing::UntilClose,
                },
            }
        };

        self.after_end = if head.status == 101 {
            State::Upgraded
        } else {
            State::Head
        };
        self.framer.start_body(framing);
        Ok(Some(Part::Head(head)))
    }

    /// Signal end of input. Completes a close-delimited body.
    pub fn finish(&mut self) -> Option<Part<ResponseHead>> {
        if self.framer.state == State::UntilClose && self.framer.buf.is_empty() {
            self.framer.state = State::Head;
            return Some(Part::End);
        }
        None
    }

    /// True once a `101 Switching Protocols` response has been fully framed.
    pub fn is_upgraded(&self) -> bool {
        self.framer.state == State::Upgraded
    }
}
