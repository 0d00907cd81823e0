use std::collections::HashMap;

use tokio::io::AsyncBufRead;

use crate::codec::{self, BodyFraming};
use crate::content::Content;
use crate::encoding::{self, HasContent};
use crate::error::FlowError;
use crate::form::{HttpVersion, RequestForm};
use crate::headers::HeaderMap;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// An HTTP request, as received from (`form_in`) or intended for
/// (`form_out`) the wire (spec §3).
#[derive(Debug, Clone)]
pub struct Request {
    pub form_in: RequestForm,
    pub form_out: RequestForm,
    pub method: String,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub httpversion: HttpVersion,
    pub headers: HeaderMap,
    pub content: Content,
    pub timestamp_start: f64,
    pub timestamp_end: f64,

    // Transient flags: excluded from state serialization (spec §3 Invariants).
    pub stickycookie: bool,
    pub stickyauth: bool,
    pub is_replay: bool,
}

impl HasContent for Request {
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

impl Request {
    /// Parses one request from `reader`. `include_content` controls whether
    /// the body is read at all; when it is and the body exceeds
    /// `body_size_limit`, the content becomes [`Content::Elided`] rather
    /// than a hard error, matching the "skip body" caller policy in spec §5.
    pub async fn from_stream<R: AsyncBufRead + Unpin>(
        reader: &mut R,
        include_content: bool,
        body_size_limit: Option<usize>,
    ) -> Result<Self, FlowError> {
        let timestamp_start = codec::now_secs();
        let block = codec::read_head_block(reader).await?;

        let mut header_storage = [httparse::EMPTY_HEADER; 128];
        let mut parsed = httparse::Request::new(&mut header_storage);
        let parse_result = parsed
            .parse(&block)
            .map_err(|e| FlowError::ParseError(format!("bad request line or headers: {e}")))?;
        if parse_result.is_partial() {
            return Err(FlowError::ParseError("incomplete request head".into()));
        }

        let method = parsed.method.ok_or_else(|| FlowError::ParseError("missing method".into()))?.to_string();
        let raw_path = parsed.path.ok_or_else(|| FlowError::ParseError("missing request target".into()))?;
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

        let (form_in, scheme, host, port, path) = classify_target(&method, raw_path)?;

        let content = if include_content {
            let framing = codec::request_body_framing(&headers);
            codec::read_body(reader, framing, body_size_limit, true).await?
        } else {
            Content::Absent
        };
        let timestamp_end = codec::now_secs();

        Ok(Request {
            form_in,
            form_out: form_in,
            method,
            scheme,
            host,
            port,
            path,
            httpversion: version,
            headers,
            content,
            timestamp_start,
            timestamp_end,
            stickycookie: false,
            stickyauth: false,
            is_replay: false,
        })
    }

    pub fn assemble_first_line(&self, form: Option<RequestForm>) -> Result<String, FlowError> {
        let form = form.unwrap_or(self.form_out);
        let v = self.httpversion;
        Ok(match form {
            RequestForm::Asterisk | RequestForm::Origin => {
                let path = self.path.as_deref().unwrap_or("/");
                format!("{} {} {v}", self.method, path)
            }
            RequestForm::Authority => {
                let host = self.host.as_deref().ok_or_else(|| FlowError::InvalidRequest("authority form missing host".into()))?;
                let port = self.port.ok_or_else(|| FlowError::InvalidRequest("authority form missing port".into()))?;
                format!("{} {host}:{port} {v}", self.method)
            }
            RequestForm::Absolute => {
                let scheme = self.scheme.as_deref().unwrap_or("http");
                let host = self.host.as_deref().ok_or_else(|| FlowError::InvalidRequest("absolute form missing host".into()))?;
                let port = self.port.ok_or_else(|| FlowError::InvalidRequest("absolute form missing port".into()))?;
                let path = self.path.as_deref().unwrap_or("/");
                format!("{} {scheme}://{host}:{port}{path} {v}", self.method)
            }
        })
    }

    pub fn assemble_headers(&self) -> String {
        let mut headers = self.headers.clone();
        headers.remove_all(&["Proxy-Connection", "Keep-Alive", "Connection", "Transfer-Encoding"]);

        if !headers.contains("host") {
            if let (Some(host), Some(port)) = (&self.host, self.port) {
                headers.set("Host", hostport(self.scheme.as_deref().unwrap_or("http"), host, port));
            }
        }

        if self.content.is_present() {
            headers.set("Content-Length", self.content.len().to_string());
        } else if self.headers.contains("transfer-encoding") {
            headers.set("Content-Length", "0");
        }

        headers.to_string()
    }

    pub fn assemble_head(&self, form: Option<RequestForm>) -> Result<String, FlowError> {
        Ok(format!("{}\r\n{}\r\n", self.assemble_first_line(form)?, self.assemble_headers()))
    }

    /// Renders the full wire bytes for transmission. Fails if content was
    /// [`Content::Elided`] (spec §4.1, "Fail if `content == CONTENT_MISSING`").
    pub fn assemble(&self) -> Result<Vec<u8>, FlowError> {
        if self.content.is_elided() {
            return Err(FlowError::ContentElided);
        }
        let mut out = self.assemble_head(None)?.into_bytes();
        if let Content::Bytes(b) = &self.content {
            out.extend_from_slice(b);
        }
        Ok(out)
    }

    pub fn size(&self) -> Result<usize, FlowError> {
        Ok(self.assemble_head(None)?.len() + self.content.len())
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Removes headers that might produce a cached response.
    pub fn anticache(&mut self) {
        self.headers.remove("if-modified-since");
        self.headers.remove("if-none-match");
    }

    /// Forces `Accept-Encoding: identity` so upstream sends uncompressed.
    pub fn anticomp(&mut self) {
        self.headers.set("accept-encoding", "identity");
    }

    /// Limits `Accept-Encoding` to codecs this proxy can decode.
    pub fn constrain_encoding(&mut self) {
        if let Some(accepted) = self.headers.get_first("accept-encoding") {
            let accepted = accepted.to_string();
            let kept: Vec<&str> = encoding::SUPPORTED_ENCODINGS
                .iter()
                .copied()
                .filter(|e| accepted.contains(e))
                .collect();
            if !kept.is_empty() {
                self.headers.set("accept-encoding", kept.join(", "));
            }
        }
    }

    /// Parses the `Cookie` header into name -> (value, attributes) pairs.
    /// Request-side cookies carry no attributes.
    pub fn get_cookies(&self) -> Option<HashMap<String, (String, HashMap<String, String>)>> {
        let values = self.headers.get_all("cookie");
        if values.is_empty() {
            return None;
        }
        let mut cookies = HashMap::new();
        for header in values {
            for pair in header.split(';') {
                let mut parts = pair.splitn(2, '=');
                let name = parts.next().unwrap_or("").trim().to_string();
                let value = parts.next().unwrap_or("").trim().to_string();
                if !name.is_empty() {
                    cookies.insert(name, (value, HashMap::new()));
                }
            }
        }
        Some(cookies)
    }

    /// Retrieves the URL-encoded form body as ordered key/value pairs.
    /// Returns an empty list if there is no body or the content-type isn't
    /// `application/x-www-form-urlencoded`.
    pub fn get_form_urlencoded(&self) -> Vec<(String, String)> {
        if !self.headers.in_any("content-type", FORM_URLENCODED, true) {
            return Vec::new();
        }
        match &self.content {
            Content::Bytes(b) => url::form_urlencoded::parse(b).into_owned().collect(),
            _ => Vec::new(),
        }
    }

    /// Replaces the body with URL-encoded form data and sets the
    /// content-type header. Destroys any existing body.
    pub fn set_form_urlencoded(&mut self, pairs: &[(String, String)]) {
        self.headers.set("Content-Type", FORM_URLENCODED);
        let encoded = url::form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish();
        self.content = Content::Bytes(encoded.into_bytes());
    }

    /// Returns the unquoted path components of the request URL.
    pub fn get_path_components(&self) -> Vec<String> {
        let Some(url) = self.get_url().and_then(|u| url::Url::parse(&u).ok()) else { return Vec::new() };
        url.path_segments().map(|segs| segs.filter(|s| !s.is_empty()).map(String::from).collect()).unwrap_or_default()
    }

    /// Sets the path component of the request URL from a list of unquoted
    /// components; each component is quoted.
    pub fn set_path_components(&mut self, components: &[String]) -> bool {
        let Some(current) = self.get_url() else { return false };
        let Ok(mut url) = url::Url::parse(&current) else { return false };
        match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.clear();
                segments.extend(components.iter().map(String::as_str));
            }
            Err(()) => return false,
        }
        self.set_url(url.as_str())
    }

    /// Gets the request query string as ordered key/value pairs.
    pub fn get_query(&self) -> Vec<(String, String)> {
        let Some(url) = self.get_url().and_then(|u| url::Url::parse(&u).ok()) else { return Vec::new() };
        url.query_pairs().into_owned().collect()
    }

    /// Sets the request query string from ordered key/value pairs.
    pub fn set_query(&mut self, pairs: &[(String, String)]) -> bool {
        let Some(current) = self.get_url() else { return false };
        let Ok(mut url) = url::Url::parse(&current) else { return false };
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        self.set_url(url.as_str())
    }

    pub fn get_url(&self) -> Option<String> {
        let scheme = self.scheme.as_deref().unwrap_or("http");
        let host = self.host.as_deref()?;
        let port = self.port?;
        let path = self.path.as_deref().unwrap_or("/");
        Some(format!("{scheme}://{}{path}", hostport(scheme, host, port)))
    }

    pub fn set_url(&mut self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else { return false };
        let Some(host) = parsed.host_str() else { return false };
        let scheme = parsed.scheme().to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);
        self.scheme = Some(scheme);
        self.host = Some(host.to_string());
        self.port = Some(port);
        self.path = Some(format!(
            "{}{}",
            parsed.path(),
            parsed.query().map(|q| format!("?{q}")).unwrap_or_default()
        ));
        true
    }

    /// Applies `pattern` -> `repl` to headers, path, and body. Body
    /// replacement decodes content-encoded bodies first and re-encodes
    /// after. Returns the total number of substitutions.
    pub fn replace(&mut self, pattern: &str, repl: &str) -> Result<usize, regex::Error> {
        let text_re = regex::Regex::new(pattern)?;
        let bytes_re = regex::bytes::Regex::new(pattern)?;

        let mut count = 0;
        encoding::with_decoded(self, |msg| {
            if let Content::Bytes(b) = msg.content() {
                let replaced = bytes_re.replace_all(b, repl.as_bytes()).into_owned();
                count += bytes_re.find_iter(b).count();
                msg.set_content(Content::Bytes(replaced));
            }
        });
        count += self.headers.replace(&text_re, repl);
        if let Some(path) = &self.path {
            let new_path = text_re.replace_all(path, repl).into_owned();
            if &new_path != path {
                count += text_re.find_iter(path).count();
                self.path = Some(new_path);
            }
        }
        Ok(count)
    }
}

fn hostport(scheme: &str, host: &str, port: u16) -> String {
    let default_port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
    if port == default_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

fn classify_target(
    method: &str,
    raw_path: &str,
) -> Result<(RequestForm, Option<String>, Option<String>, Option<u16>, Option<String>), FlowError> {
    if raw_path == "*" {
        return Ok((RequestForm::Asterisk, None, None, None, Some(raw_path.to_string())));
    }
    if raw_path.starts_with('/') {
        if !raw_path.is_ascii() {
            return Err(FlowError::ParseError(format!("non-ASCII path in origin-form request: {raw_path:?}")));
        }
        return Ok((RequestForm::Origin, None, None, None, Some(raw_path.to_string())));
    }
    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_authority(raw_path)
            .ok_or_else(|| FlowError::ParseError(format!("bad CONNECT target: {raw_path:?}")))?;
        return Ok((RequestForm::Authority, None, Some(host), Some(port), None));
    }
    let url = url::Url::parse(raw_path).map_err(|_| FlowError::ParseError(format!("bad absolute-form target: {raw_path:?}")))?;
    let scheme = url.scheme().to_string();
    let host = url.host_str().ok_or_else(|| FlowError::ParseError("absolute-form target missing host".into()))?.to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    let path = format!("{}{}", url.path(), url.query().map(|q| format!("?{q}")).unwrap_or_default());
    Ok((RequestForm::Absolute, Some(scheme), Some(host), Some(port), Some(path)))
}

fn parse_authority(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse(raw: &[u8]) -> Request {
        let mut reader = Cursor::new(raw.to_vec());
        Request::from_stream(&mut reader, true, None).await.unwrap()
    }

    #[tokio::test]
    async fn origin_form_classified() {
        let req = parse(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert_eq!(req.form_in, RequestForm::Origin);
        assert_eq!(req.path.as_deref(), Some("/x"));
    }

    #[tokio::test]
    async fn absolute_form_extracts_scheme_host_port_path() {
        let req = parse(b"GET http://a:80/x HTTP/1.1\r\n\r\n").await;
        assert_eq!(req.form_in, RequestForm::Absolute);
        assert_eq!(req.scheme.as_deref(), Some("http"));
        assert_eq!(req.host.as_deref(), Some("a"));
        assert_eq!(req.port, Some(80));
        assert_eq!(req.path.as_deref(), Some("/x"));
    }

    #[tokio::test]
    async fn connect_form_extracts_authority() {
        let req = parse(b"CONNECT a:443 HTTP/1.1\r\n\r\n").await;
        assert_eq!(req.form_in, RequestForm::Authority);
        assert_eq!(req.host.as_deref(), Some("a"));
        assert_eq!(req.port, Some(443));
        assert!(req.path.is_none());
    }

    #[tokio::test]
    async fn asterisk_form_classified() {
        let req = parse(b"OPTIONS * HTTP/1.1\r\n\r\n").await;
        assert_eq!(req.form_in, RequestForm::Asterisk);
    }

    #[tokio::test]
    async fn assembles_origin_passthrough() {
        let req = parse(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n").await;
        let first_line = req.assemble_first_line(None).unwrap();
        assert_eq!(first_line, "GET /x HTTP/1.1");
        assert!(!req.assemble_headers().to_ascii_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn assemble_rewrites_absolute_to_origin_when_form_out_changed() {
        let mut req = parse(b"GET http://a:80/x HTTP/1.1\r\n\r\n").await;
        req.form_out = RequestForm::Origin;
        assert_eq!(req.assemble_first_line(None).unwrap(), "GET /x HTTP/1.1");
    }

    #[tokio::test]
    async fn elided_content_fails_assembly() {
        let mut req = parse(b"GET /x HTTP/1.1\r\n\r\n").await;
        req.content = Content::Elided;
        assert!(matches!(req.assemble(), Err(FlowError::ContentElided)));
    }

    #[tokio::test]
    async fn non_ascii_origin_path_rejected() {
        let mut reader = Cursor::new(b"GET /\xc3\xa9 HTTP/1.1\r\n\r\n".to_vec());
        let err = Request::from_stream(&mut reader, true, None).await.unwrap_err();
        assert!(matches!(err, FlowError::ParseError(_)));
    }

    #[tokio::test]
    async fn body_size_limit_elides_content() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut reader = Cursor::new(raw.to_vec());
        let req = Request::from_stream(&mut reader, true, Some(4)).await.unwrap();
        assert_eq!(req.content, Content::Elided);
    }

    #[tokio::test]
    async fn get_form_urlencoded_parses_body() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 14\r\n\r\na=1&b=hi+there";
        let mut reader = Cursor::new(raw.to_vec());
        let req = Request::from_stream(&mut reader, true, None).await.unwrap();
        assert_eq!(req.get_form_urlencoded(), vec![("a".to_string(), "1".to_string()), ("b".to_string(), "hi there".to_string())]);
    }

    #[tokio::test]
    async fn get_form_urlencoded_ignores_non_form_content_type() {
        let req = parse(b"GET /x HTTP/1.1\r\n\r\n").await;
        assert!(req.get_form_urlencoded().is_empty());
    }

    #[tokio::test]
    async fn set_form_urlencoded_sets_body_and_content_type() {
        let mut req = parse(b"GET /x HTTP/1.1\r\n\r\n").await;
        req.set_form_urlencoded(&[("a".into(), "1".into()), ("b".into(), "hi there".into())]);
        assert_eq!(req.headers.get_first("content-type"), Some("application/x-www-form-urlencoded"));
        assert_eq!(req.content, Content::Bytes(b"a=1&b=hi+there".to_vec()));
    }

    #[tokio::test]
    async fn get_path_components_splits_and_unquotes() {
        let req = parse(b"GET http://a/foo/a%20b HTTP/1.1\r\n\r\n").await;
        assert_eq!(req.get_path_components(), vec!["foo".to_string(), "a b".to_string()]);
    }

    #[tokio::test]
    async fn set_path_components_quotes_and_joins() {
        let mut req = parse(b"GET http://a/x HTTP/1.1\r\n\r\n").await;
        assert!(req.set_path_components(&["a b".into(), "c".into()]));
        assert_eq!(req.path.as_deref(), Some("/a%20b/c"));
    }

    #[tokio::test]
    async fn get_query_parses_pairs() {
        let req = parse(b"GET http://a/x?foo=bar&baz=1 HTTP/1.1\r\n\r\n").await;
        assert_eq!(req.get_query(), vec![("foo".to_string(), "bar".to_string()), ("baz".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn set_query_rewrites_query_string() {
        let mut req = parse(b"GET http://a/x?old=1 HTTP/1.1\r\n\r\n").await;
        assert!(req.set_query(&[("new".into(), "2".into())]));
        assert_eq!(req.path.as_deref(), Some("/x?new=2"));
    }

    #[test]
    fn anticache_removes_cache_headers() {
        let mut req = Request {
            form_in: RequestForm::Origin,
            form_out: RequestForm::Origin,
            method: "GET".into(),
            scheme: None,
            host: None,
            port: None,
            path: Some("/".into()),
            httpversion: HttpVersion::HTTP_11,
            headers: HeaderMap::new(),
            content: Content::Absent,
            timestamp_start: 0.0,
            timestamp_end: 0.0,
            stickycookie: false,
            stickyauth: false,
            is_replay: false,
        };
        req.headers.add("If-Modified-Since", "yesterday");
        req.headers.add("If-None-Match", "etag");
        req.anticache();
        assert!(!req.headers.contains("if-modified-since"));
        assert!(!req.headers.contains("if-none-match"));
    }
}
