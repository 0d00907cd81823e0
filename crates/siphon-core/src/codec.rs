//! Shared HTTP/1.x wire framing: line reading with the leading-blank-line
//! tolerance, and body framing rules (spec §4.1).

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::FlowError;
use crate::headers::HeaderMap;

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn read_line_bytes<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FlowError> {
    let mut buf = Vec::new();
    reader
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|e| FlowError::Transport(e.to_string()))?;
    Ok(buf)
}

/// Reads the request-line/status-line plus the header block, up to and
/// including the terminating blank line. Tolerates one leading blank line
/// left over from a previous keep-alive message (spec §4.1, "Request
/// parse").
pub async fn read_head_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FlowError> {
    let mut first = read_line_bytes(reader).await?;
    if first == b"\r\n" || first == b"\n" {
        first = read_line_bytes(reader).await?;
    }
    if first.is_empty() {
        return Err(FlowError::Transport("connection closed".into()));
    }
    let mut block = first;
    loop {
        let line = read_line_bytes(reader).await?;
        if line.is_empty() {
            return Err(FlowError::Transport("connection closed while reading headers".into()));
        }
        let is_blank = line == b"\r\n" || line == b"\n";
        block.extend_from_slice(&line);
        if is_blank {
            break;
        }
    }
    Ok(block)
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body, regardless of what headers say (HEAD responses, 1xx/204/304).
    None,
    /// Exactly `usize` bytes, per `Content-Length`.
    Length(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No explicit framing header; read until the connection closes
    /// (legal only for responses).
    UntilClose,
}

pub fn request_body_framing(headers: &HeaderMap) -> BodyFraming {
    if is_chunked(headers) {
        return BodyFraming::Chunked;
    }
    if let Some(n) = content_length(headers) {
        return BodyFraming::Length(n);
    }
    BodyFraming::None
}

pub fn response_body_framing(request_method: &str, status: u16, headers: &HeaderMap) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD") {
        return BodyFraming::None;
    }
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return BodyFraming::None;
    }
    if is_chunked(headers) {
        return BodyFraming::Chunked;
    }
    if let Some(n) = content_length(headers) {
        return BodyFraming::Length(n);
    }
    BodyFraming::UntilClose
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_first("transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers.get_first("content-length").and_then(|v| v.trim().parse().ok())
}

/// `Connection: close`, or HTTP/1.0 without an explicit `Connection:
/// keep-alive` (spec §4.4 step 7).
pub fn connection_close(httpversion: crate::form::HttpVersion, headers: &HeaderMap) -> bool {
    if let Some(conn) = headers.get_first("connection") {
        let conn = conn.to_ascii_lowercase();
        if conn.contains("close") {
            return true;
        }
        if conn.contains("keep-alive") {
            return false;
        }
    }
    httpversion.major == 1 && httpversion.minor == 0
}

/// Reads a body per `framing`, capped at `body_size_limit` bytes. Exceeding
/// the limit is a parse error unless `elide_on_limit` is set, in which case
/// the body becomes [`crate::content::Content::Elided`] (spec §5, "Body
/// size limit").
pub async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    framing: BodyFraming,
    body_size_limit: Option<usize>,
    elide_on_limit: bool,
) -> Result<crate::content::Content, FlowError> {
    use crate::content::Content;

    match framing {
        BodyFraming::None => Ok(Content::Absent),
        BodyFraming::Length(n) => {
            if over_limit(n, body_size_limit) {
                return over_limit_result(elide_on_limit);
            }
            let mut buf = vec![0u8; n];
            reader.read_exact(&mut buf).await.map_err(|e| FlowError::Transport(e.to_string()))?;
            Ok(Content::Bytes(buf))
        }
        BodyFraming::Chunked => {
            let mut out = Vec::new();
            loop {
                let size_line = read_line_bytes(reader).await?;
                if size_line.is_empty() {
                    return Err(FlowError::Transport("connection closed mid-chunk".into()));
                }
                let size_str = String::from_utf8_lossy(&size_line);
                let size_str = size_str.trim().split(';').next().unwrap_or("").trim();
                let size = usize::from_str_radix(size_str, 16)
                    .map_err(|_| FlowError::ParseError(format!("bad chunk size: {size_str:?}")))?;
                if size == 0 {
                    loop {
                        let trailer = read_line_bytes(reader).await?;
                        if trailer.is_empty() || trailer == b"\r\n" || trailer == b"\n" {
                            break;
                        }
                    }
                    break;
                }
                if over_limit(out.len() + size, body_size_limit) {
                    return over_limit_result(elide_on_limit);
                }
                let mut chunk = vec![0u8; size];
                reader.read_exact(&mut chunk).await.map_err(|e| FlowError::Transport(e.to_string()))?;
                out.extend_from_slice(&chunk);
                let mut crlf = [0u8; 2];
                reader.read_exact(&mut crlf).await.map_err(|e| FlowError::Transport(e.to_string()))?;
            }
            Ok(Content::Bytes(out))
        }
        BodyFraming::UntilClose => {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.map_err(|e| FlowError::Transport(e.to_string()))?;
            if over_limit(out.len(), body_size_limit) {
                return over_limit_result(elide_on_limit);
            }
            Ok(Content::Bytes(out))
        }
    }
}

fn over_limit(n: usize, limit: Option<usize>) -> bool {
    limit.is_some_and(|limit| n > limit)
}

fn over_limit_result(elide: bool) -> Result<crate::content::Content, FlowError> {
    if elide {
        Ok(crate::content::Content::Elided)
    } else {
        Err(FlowError::BodyLimitExceeded)
    }
}
