use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::headers::HeaderMap;

/// A non-HTTP failure: a disconnect, timeout, or protocol error. Distinct
/// from an HTTP error response (a normal [`crate::response::Response`] with
/// e.g. status 500).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Error {
    pub msg: String,
    pub timestamp: f64,
}

impl Error {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into(), timestamp: now_secs() }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The error taxonomy a flow's outer boundary classifies caught failures
/// into (spec §7). Each variant that carries an HTTP status is rendered by
/// the error synthesizer into a canned response.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("malformed request: {0}")]
    ParseError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("must not CONNECT on an already encrypted connection")]
    TunnelOnTls,

    #[error("upstream proxy refused CONNECT")]
    UpstreamProxyHandshake { headers: HeaderMap },

    #[error("proxy authentication required")]
    AuthRequired { challenge_headers: HeaderMap },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("body size limit exceeded")]
    BodyLimitExceeded,

    #[error("content was elided and cannot be assembled")]
    ContentElided,
}

impl FlowError {
    /// The HTTP status code to report to the client, if any. `BodyLimitExceeded`
    /// has no fixed code here: callers translate it to 400 or to
    /// `Content::Elided` depending on policy (spec §5, "Body size limit").
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FlowError::ParseError(_) | FlowError::InvalidRequest(_) => Some(400),
            FlowError::TunnelOnTls | FlowError::UpstreamProxyHandshake { .. } | FlowError::Transport(_) => Some(502),
            FlowError::AuthRequired { .. } => Some(407),
            FlowError::BodyLimitExceeded => Some(400),
            FlowError::ContentElided => None,
        }
    }

    /// Extra headers that should accompany the synthesized error response
    /// (the auth challenge, or the upstream proxy's refusal headers).
    pub fn extra_headers(&self) -> Option<&HeaderMap> {
        match self {
            FlowError::AuthRequired { challenge_headers } => Some(challenge_headers),
            FlowError::UpstreamProxyHandshake { headers } => Some(headers),
            _ => None,
        }
    }
}
