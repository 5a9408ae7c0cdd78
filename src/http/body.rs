//! Body accessors and encoding helpers
//!
//! Everything here is lossy on purpose: a body that cannot be decoded is
//! reported as absent, never as an error.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::MultiGzDecoder;
use std::collections::BTreeMap;
use std::io::Read;

use super::codec::{find_header, Header};

/// Undo the `Content-Encoding` of `raw`.
///
/// Identity bodies are returned as-is, gzip bodies are inflated, and any
/// other coding (or a corrupt gzip stream) yields `None`.
pub fn decode_body(headers: &[Header], raw: &[u8]) -> Option<Vec<u8>> {
    match find_header(headers, "content-encoding").map(str::trim) {
        None | Some("") => Some(raw.to_vec()),
        Some(coding) if coding.eq_ignore_ascii_case("identity") => Some(raw.to_vec()),
        Some(coding) if coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip") => {
            gunzip(raw)
        }
        Some(_) => None,
    }
}

pub fn gunzip(raw: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(raw);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Pretty-printed JSON with object keys in sorted order.
pub fn canonical_json(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    serde_json::to_string_pretty(&value).ok()
}

pub fn base64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn base64_decode(text: &str) -> Option<Vec<u8>> {
    STANDARD.decode(text).ok()
}

/// Headers as a JSON object (repeated names joined with ", "), base64 encoded.
pub fn headers_base64(headers: &[Header]) -> String {
    let mut map: BTreeMap<&str, String> = BTreeMap::new();
    for header in headers {
        map.entry(header.name.as_str())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(&header.value);
            })
            .or_insert_with(|| header.value.clone());
    }
    let json = serde_json::to_vec(&map).unwrap_or_default();
    base64_encode(&json)
}

pub(crate) fn serialize_base64<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: serde::Serializer,
{
    serializer.serialize_str(&base64_encode(bytes.as_ref()))
}
