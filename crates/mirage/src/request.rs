//! Parsed request/response data model.
//!
//! A [`ParsedRequest`] is immutable after parsing: the listener captures the
//! head as soon as it arrives, then fills in the body once it has been read
//! (subject to the configured capture cap).

use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};

/// Wire protocol the exchange arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    WebSocket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Ordered header list. Duplicate names are preserved in arrival order;
/// lookups are case-insensitive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&HeaderMap> for HeaderList {
    fn from(map: &HeaderMap) -> Self {
        let mut list = HeaderList::new();
        // HeaderMap::iter yields each value of a repeated header separately.
        for (name, value) in map {
            list.push(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        list
    }
}

impl FromIterator<(String, String)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Request body as captured by the listener.
///
/// When the body exceeded the configured `max_body_size`, the capture is
/// flagged oversized: matchers and recorded traffic then see an empty body,
/// while passthrough still forwards the raw bytes.
#[derive(Clone, Debug, Default)]
pub struct CapturedBody {
    bytes: Bytes,
    oversized: bool,
}

impl CapturedBody {
    pub fn new(bytes: Bytes, max_body_size: usize) -> Self {
        let oversized = bytes.len() > max_body_size;
        Self { bytes, oversized }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The matching view: empty when the capture cap was exceeded.
    pub fn as_bytes(&self) -> &[u8] {
        if self.oversized {
            &[]
        } else {
            &self.bytes
        }
    }

    /// The full bytes regardless of the cap, for forwarding.
    pub fn raw(&self) -> &Bytes {
        &self.bytes
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn is_oversized(&self) -> bool {
        self.oversized
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// A fully parsed incoming request.
#[derive(Clone, Debug)]
pub struct ParsedRequest {
    /// Monotonic per-server id.
    pub id: u64,
    pub received_at: DateTime<Utc>,
    pub remote_addr: SocketAddr,
    pub protocol: Protocol,
    pub scheme: Scheme,
    /// Hostname without port.
    pub host: String,
    pub port: u16,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderList,
    pub body: CapturedBody,
    pub trailers: Option<HeaderList>,
}

impl ParsedRequest {
    /// Absolute URL including the query string.
    pub fn url(&self) -> String {
        let mut url = self.url_without_query();
        if let Some(q) = &self.query {
            url.push('?');
            url.push_str(q);
        }
        url
    }

    /// Absolute URL with the query string stripped, default ports omitted.
    pub fn url_without_query(&self) -> String {
        if self.port == self.scheme.default_port() {
            format!("{}://{}{}", self.scheme.as_str(), self.host, self.path)
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme.as_str(),
                self.host,
                self.port,
                self.path
            )
        }
    }

    /// `host[:port]`, with default ports omitted.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Cookie pairs from every `Cookie` header, in order.
    pub fn cookies(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for value in self.headers.get_all("cookie") {
            for pair in value.split(';') {
                if let Some((k, v)) = pair.split_once('=') {
                    out.push((k.trim().to_string(), v.trim().to_string()));
                }
            }
        }
        out
    }

    /// Decoded query parameters, in order.
    pub fn query_params(&self) -> Vec<(String, String)> {
        match &self.query {
            Some(q) => parse_query_pairs(q),
            None => Vec::new(),
        }
    }
}

/// Decode `k=v&k2=v2` into pairs. Keys without `=` get an empty value.
pub(crate) fn parse_query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.to_string()),
                urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_else(|_| v.to_string()),
            )
        })
        .collect()
}

/// A response as produced by a handler, used for events, recorded traffic
/// and callback return values.
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers: HeaderList::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T: serde::Serialize>(status: u16, value: &T) -> anyhow::Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body))
    }
}

/// One recorded exchange on a rule's seen list.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub request: ParsedRequest,
    pub response: Option<MockResponse>,
}
