use std::fmt;

/// The shape of a request-line, recorded once at parse time (`form_in`) and
/// mutated by proxy logic before emission (`form_out`). See GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestForm {
    /// `GET /index.html` — target addressed relative to the connection.
    Origin,
    /// `GET http://example.com:80/index.html` — full target URL.
    Absolute,
    /// `CONNECT example.com:443` — tunnel establishment.
    Authority,
    /// `OPTIONS *` — server-wide request, no specific resource.
    Asterisk,
}

impl fmt::Display for RequestForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestForm::Origin => "origin",
            RequestForm::Absolute => "absolute",
            RequestForm::Authority => "authority",
            RequestForm::Asterisk => "asterisk",
        };
        f.write_str(s)
    }
}

/// An HTTP/1.x version, e.g. `HttpVersion(1, 1)` for HTTP/1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };

    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}
