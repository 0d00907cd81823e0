use std::collections::HashMap;

use tokio::io::AsyncBufRead;

use crate::codec::{self};
use crate::content::Content;
use crate::encoding::{self, HasContent};
use crate::error::FlowError;
use crate::form::HttpVersion;
use crate::headers::HeaderMap;

/// An HTTP response (spec §3).
#[derive(Debug, Clone)]
pub struct Response {
    pub httpversion: HttpVersion,
    pub code: u16,
    pub msg: String,
    pub headers: HeaderMap,
    pub content: Content,
    pub timestamp_start: f64,
    pub timestamp_end: f64,

    /// Transient: excluded from state serialization.
    pub is_replay: bool,
}

impl HasContent for Response {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
    fn content(&self) -> &Content {
        &self.content
    }
    fn set_content(&mut self, content: Content) {
        self.content = content;
    }
}

impl Response {
    /// Parses one response from `reader`. Body framing depends on
    /// `request_method` (e.g. HEAD implies no body) and the status code
    /// (1xx/204/304 imply no body), spec §4.1 "Response parse".
    pub async fn from_stream<R: AsyncBufRead + Unpin>(
        reader: &mut R,
        request_method: &str,
        include_content: bool,
        body_size_limit: Option<usize>,
    ) -> Result<Self, FlowError> {
        let timestamp_start = codec::now_secs();
        let block = codec::read_head_block(reader).await?;

        let mut header_storage = [httparse::EMPTY_HEADER; 128];
        let mut parsed = httparse::Response::new(&mut header_storage);
        let parse_result = parsed
            .parse(&block)
            .map_err(|e| FlowError::ParseError(format!("bad status line or headers: {e}")))?;
        if parse_result.is_partial() {
            return Err(FlowError::ParseError("incomplete response head".into()));
        }

        let code = parsed.code.ok_or_else(|| FlowError::ParseError("missing status code".into()))?;
        let msg = parsed.reason.unwrap_or("").to_string();
        let version = match parsed.version {
            Some(0) => HttpVersion::HTTP_10,
            Some(1) => HttpVersion::HTTP_11,
            _ => return Err(FlowError::ParseError("unsupported HTTP version".into())),
        };

        let mut headers = HeaderMap::new();
        for h in parsed.headers.iter() {
            if h.name.is_empty() {
                continue;
            }
            headers.add(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
        }

        let content = if include_content {
            let framing = codec::response_body_framing(request_method, code, &headers);
            codec::read_body(reader, framing, body_size_limit, true).await?
        } else {
            Content::Absent
        };
        let timestamp_end = codec::now_secs();

        Ok(Response {
            httpversion: version,
            code,
            msg,
            headers,
            content,
            timestamp_start,
            timestamp_end,
            is_replay: false,
        })
    }

    pub fn assemble_first_line(&self) -> String {
        format!("{} {} {}", self.httpversion, self.code, self.msg)
    }

    pub fn assemble_headers(&self) -> String {
        let mut headers = self.headers.clone();
        headers.remove_all(&["Proxy-Connection", "Transfer-Encoding"]);

        if self.content.is_present() {
            headers.set("Content-Length", self.content.len().to_string());
        } else if self.headers.contains("transfer-encoding") {
            headers.set("Content-Length", "0");
        }

        headers.to_string()
    }

    pub fn assemble_head(&self) -> String {
        format!("{}\r\n{}\r\n", self.assemble_first_line(), self.assemble_headers())
    }

    /// Renders the full wire bytes for transmission to the client. Fails if
    /// content was [`Content::Elided`].
    pub fn assemble(&self) -> Result<Vec<u8>, FlowError> {
        if self.content.is_elided() {
            return Err(FlowError::ContentElided);
        }
        let mut out = self.assemble_head().into_bytes();
        if let Content::Bytes(b) = &self.content {
            out.extend_from_slice(b);
        }
        Ok(out)
    }

    pub fn size(&self) -> usize {
        self.assemble_head().len() + self.content.len()
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Parses `Set-Cookie` into name -> (value, lowercased-attribute-map)
    /// pairs, matching http.py `get_cookies`.
    pub fn get_cookies(&self) -> Option<HashMap<String, (String, HashMap<String, String>)>> {
        let values = self.headers.get_all("set-cookie");
        if values.is_empty() {
            return None;
        }
        let mut cookies = HashMap::new();
        for header in values {
            let mut pairs = header.split(';').map(|p| {
                let mut kv = p.splitn(2, '=');
                (kv.next().unwrap_or("").trim(), kv.next().unwrap_or("").trim())
            });
            let Some((name, value)) = pairs.next() else { continue };
            if name.is_empty() {
                continue;
            }
            let attrs = pairs
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect::<HashMap<_, _>>();
            cookies.insert(name.to_string(), (value.to_string(), attrs));
        }
        Some(cookies)
    }

    /// Applies `pattern` -> `repl` to headers and body. Body replacement
    /// decodes content-encoded bodies first and re-encodes after. Returns
    /// the total number of substitutions.
    pub fn replace(&mut self, pattern: &str, repl: &str) -> Result<usize, regex::Error> {
        let text_re = regex::Regex::new(pattern)?;
        let bytes_re = regex::bytes::Regex::new(pattern)?;

        let mut count = 0;
        encoding::with_decoded(self, |msg| {
            if let Content::Bytes(b) = msg.content() {
                count += bytes_re.find_iter(b).count();
                let replaced = bytes_re.replace_all(b, repl.as_bytes()).into_owned();
                msg.set_content(Content::Bytes(replaced));
            }
        });
        count += self.headers.replace(&text_re, repl);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse(raw: &[u8], method: &str) -> Response {
        let mut reader = Cursor::new(raw.to_vec());
        Response::from_stream(&mut reader, method, true, None).await.unwrap()
    }

    #[tokio::test]
    async fn parses_status_line_and_headers() {
        let resp = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello", "GET").await;
        assert_eq!(resp.code, 200);
        assert_eq!(resp.msg, "OK");
        assert_eq!(resp.content.as_bytes(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn head_response_has_no_body_even_with_content_length() {
        let resp = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n", "HEAD").await;
        assert_eq!(resp.content, Content::Absent);
    }

    #[tokio::test]
    async fn no_content_status_has_no_body() {
        let resp = parse(b"HTTP/1.1 304 Not Modified\r\n\r\n", "GET").await;
        assert_eq!(resp.content, Content::Absent);
    }

    #[tokio::test]
    async fn assemble_strips_transfer_encoding_and_sets_content_length() {
        let resp = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n0\r\n\r\n", "GET").await;
        let assembled = String::from_utf8(resp.assemble().unwrap()).unwrap();
        assert!(!assembled.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(assembled.contains("Content-Length: 4"));
    }

    #[tokio::test]
    async fn get_cookies_parses_attributes() {
        let resp = parse(b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=abc; Path=/; HttpOnly\r\n\r\n", "GET").await;
        let cookies = resp.get_cookies().unwrap();
        let (value, attrs) = &cookies["sid"];
        assert_eq!(value, "abc");
        assert_eq!(attrs.get("path").map(String::as_str), Some("/"));
    }
}
