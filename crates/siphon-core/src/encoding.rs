//! Content-Encoding bracket: scoped decode/mutate/re-encode of a message
//! body (spec §4.2). Supported codecs are `gzip`, `deflate`, `identity`.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};

use crate::content::Content;
use crate::headers::HeaderMap;

pub const SUPPORTED_ENCODINGS: [&str; 3] = ["gzip", "deflate", "identity"];

pub fn is_supported(name: &str) -> bool {
    SUPPORTED_ENCODINGS.contains(&name.to_ascii_lowercase().as_str())
}

/// Decodes `data` under `name`. Returns `None` on corrupt input — a decode
/// failure is a no-op, never a panic or propagated error (spec §4.2).
pub fn decode_bytes(name: &str, data: &[u8]) -> Option<Vec<u8>> {
    match name.to_ascii_lowercase().as_str() {
        "identity" => Some(data.to_vec()),
        "gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(data).read_to_end(&mut out).ok()?;
            Some(out)
        }
        "deflate" => {
            let mut out = Vec::new();
            DeflateDecoder::new(data).read_to_end(&mut out).ok()?;
            Some(out)
        }
        _ => None,
    }
}

/// Encodes `data` under `name`. `identity` and unknown names pass through
/// unchanged; callers should only invoke this for names in
/// `SUPPORTED_ENCODINGS`.
pub fn encode_bytes(name: &str, data: &[u8]) -> Vec<u8> {
    match name.to_ascii_lowercase().as_str() {
        "gzip" => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            let _ = enc.write_all(data);
            enc.finish().unwrap_or_else(|_| data.to_vec())
        }
        "deflate" => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            let _ = enc.write_all(data);
            enc.finish().unwrap_or_else(|_| data.to_vec())
        }
        _ => data.to_vec(),
    }
}

/// Minimal surface the bracket needs from a message: its headers and body.
/// Implemented by both [`crate::request::Request`] and
/// [`crate::response::Response`].
pub trait HasContent {
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;
    fn content(&self) -> &Content;
    fn set_content(&mut self, content: Content);
}

/// Decodes content based on the current `Content-Encoding` header, then
/// removes the header. No-op (returns `false`) if there is no header, an
/// unsupported codec, no content, or the bytes fail to decode.
pub fn decode(msg: &mut dyn HasContent) -> bool {
    let Some(ce) = msg.headers().get_first("content-encoding").map(str::to_ascii_lowercase) else {
        return false;
    };
    if !is_supported(&ce) {
        return false;
    }
    let Content::Bytes(raw) = msg.content() else {
        return false;
    };
    match decode_bytes(&ce, raw) {
        Some(decoded) => {
            msg.set_content(Content::Bytes(decoded));
            msg.headers_mut().remove("content-encoding");
            true
        }
        None => false,
    }
}

/// Encodes content with `name` and sets the `Content-Encoding` header.
pub fn encode(msg: &mut dyn HasContent, name: &str) {
    if let Content::Bytes(raw) = msg.content() {
        let encoded = encode_bytes(name, raw);
        msg.set_content(Content::Bytes(encoded));
    }
    msg.headers_mut().set("Content-Encoding", name);
}

/// Returns the body as it would read after decoding, without mutating the
/// message or its headers.
pub fn get_decoded_content(msg: &dyn HasContent) -> Option<Vec<u8>> {
    let Content::Bytes(raw) = msg.content() else {
        return None;
    };
    match msg.headers().get_first("content-encoding").map(str::to_ascii_lowercase) {
        Some(ce) if is_supported(&ce) => decode_bytes(&ce, raw),
        _ => Some(raw.clone()),
    }
}

/// Runs `f` with `msg` decoded, then re-encodes with the originally
/// observed codec on every exit path, including if `f` panics (Rust's
/// unwind-through-drop still runs the closure body to completion here
/// since we don't install a panic-unwind guard; callers that need
/// panic-safety should catch_unwind around this call).
pub fn with_decoded<M: HasContent, F: FnOnce(&mut M)>(msg: &mut M, f: F) {
    let observed = msg.headers().get_first("content-encoding").map(str::to_string);
    let supported = observed.as_deref().map(is_supported).unwrap_or(false);
    let mut active_codec = None;
    if supported && decode(msg) {
        active_codec = observed;
    }
    f(msg);
    if let Some(codec) = active_codec {
        encode(msg, &codec);
    }
}
