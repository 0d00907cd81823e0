//! Error synthesis (spec §4.8): turns a caught [`FlowError`] into a minimal
//! HTML response, or `None` if the error carries no status code (nothing
//! to send, e.g. [`FlowError::ContentElided`]).

use siphon_core::content::Content;
use siphon_core::form::HttpVersion;
use siphon_core::headers::HeaderMap;
use siphon_core::{FlowError, Response};

/// Renders the canned HTML body for a proxy-synthesized error response.
fn html_body(code: u16, message: &str) -> Vec<u8> {
    format!("<html><body><h1>{code}</h1><p>{}</p></body></html>", escape(message)).into_bytes()
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Builds the synthetic response for `err`, if it carries a status code
/// (spec §4.8: "If a code was assigned, synthesize and write a minimal
/// HTML response").
pub fn synthesize(err: &FlowError, server_version: &str) -> Option<Response> {
    let code = err.status_code()?;
    let msg = reason_phrase(code);
    let body = html_body(code, &err.to_string());

    let mut headers = HeaderMap::new();
    headers.add("Server", server_version);
    headers.add("Content-Type", "text/html");
    headers.add("Content-Length", body.len().to_string());
    headers.add("Connection", "close");
    if let Some(extra) = err.extra_headers() {
        for (name, value) in extra.iter() {
            headers.add(name, value);
        }
    }

    Some(Response {
        httpversion: HttpVersion::HTTP_11,
        code,
        msg: msg.to_string(),
        headers,
        content: Content::Bytes(body),
        timestamp_start: siphon_core::codec::now_secs(),
        timestamp_end: siphon_core::codec::now_secs(),
        is_replay: false,
    })
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        407 => "Proxy Authentication Required",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_400_for_parse_error() {
        let err = FlowError::ParseError("bad request line".into());
        let resp = synthesize(&err, "siphon/0.1").unwrap();
        assert_eq!(resp.code, 400);
        assert_eq!(resp.headers.get_first("connection"), Some("close"));
        assert!(resp.content.as_bytes().unwrap().starts_with(b"<html>"));
    }

    #[test]
    fn synthesizes_407_with_challenge_headers() {
        let mut challenge = HeaderMap::new();
        challenge.add("Proxy-Authenticate", "Basic realm=\"siphon\"");
        let err = FlowError::AuthRequired { challenge_headers: challenge };
        let resp = synthesize(&err, "siphon/0.1").unwrap();
        assert_eq!(resp.code, 407);
        assert_eq!(resp.headers.get_first("proxy-authenticate"), Some("Basic realm=\"siphon\""));
    }

    #[test]
    fn content_elided_has_no_synthesis() {
        assert!(synthesize(&FlowError::ContentElided, "siphon/0.1").is_none());
    }
}
