use std::str::FromStr;

use bytes::Bytes;

use super::{url, Body, HeaderMap, Method};
use crate::{Error, Result};

/// URL scheme of a request. Only the two HTTP schemes are modeled; Unix
/// socket transport is an orthogonal property of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
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

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

/// An HTTP request, parsed from the wire or authored by the client.
///
/// URI parameters hold both decoded query parameters and the router's path
/// captures; captures are added by the router after dispatch and shadow
/// query parameters with the same name.
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: Method,
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    params: Vec<(String, String)>,
    headers: HeaderMap,
    body: Body,
    unix_socket: Option<String>,
}

impl Request {
    pub fn new() -> Self {
        Request {
            path: "/".to_string(),
            ..Default::default()
        }
    }

    /// Builds a request from a method and an absolute URL.
    pub fn build(method: Method, url: &str) -> Result<Self> {
        let mut req = Request::new();
        req.set_method(method);
        req.set_url(url)?;
        Ok(req)
    }

    /// Parses `scheme://host[:port][/path[?query]]` into this request.
    pub fn set_url(&mut self, raw: &str) -> Result<()> {
        let err = || Error::InvalidUrl(raw.to_string());
        let (scheme, rest) = raw.split_once("://").ok_or_else(err)?;
        self.scheme = match scheme {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(err()),
        };

        let (authority, uri) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(err());
        }

        // Bracketed IPv6 literals keep their colons.
        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, tail) = stripped.split_once(']').ok_or_else(err)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| err())?),
                None if tail.is_empty() => None,
                None => return Err(err()),
            };
            (host.to_string(), port)
        } else {
            match authority.split_once(':') {
                Some((h, p)) => (h.to_string(), Some(p.parse::<u16>().map_err(|_| err())?)),
                None => (authority.to_string(), None),
            }
        };
        self.host = host;
        self.port = port;
        self.set_uri(uri);
        Ok(())
    }

    /// Sets the request target (`/path[?query]`), re-deriving the query
    /// parameters. Any previously attached parameters are discarded.
    pub fn set_uri(&mut self, uri: &str) {
        match uri.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = Some(query.to_string());
                self.params = url::parse_form(query);
            }
            None => {
                self.path = uri.to_string();
                self.query = None;
                self.params.clear();
            }
        }
        if self.path.is_empty() {
            self.path = "/".to_string();
        }
    }

    /// The path portion of the target, before any `?`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The full request target: path plus `?` and the raw query, if any.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Reconstructs the absolute URL, omitting a default port.
    pub fn url(&self) -> String {
        if self.is_default_port() {
            format!("{}://{}{}", self.scheme.as_str(), self.host, self.uri())
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme.as_str(),
                self.host,
                self.port(),
                self.uri()
            )
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn set_scheme(&mut self, scheme: Scheme) {
        self.scheme = scheme;
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// The effective port: the explicit one, or the scheme default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn is_default_port(&self) -> bool {
        match self.port {
            None => true,
            Some(p) => p == self.scheme.default_port(),
        }
    }

    /// Routes the request over a Unix-domain socket instead of TCP.
    pub fn set_unix_socket(&mut self, path: impl Into<String>) {
        self.unix_socket = Some(path.into());
    }

    pub fn unix_socket(&self) -> Option<&str> {
        self.unix_socket.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Applies a `Host` header value (`host[:port]`) to this request.
    pub fn apply_host(&mut self, value: &str) {
        match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(']') || host.ends_with(']') => {
                if let Ok(port) = port.parse::<u16>() {
                    self.host = host.trim_matches(['[', ']']).to_string();
                    self.port = Some(port);
                    return;
                }
                self.host = value.to_string();
            }
            _ => self.host = value.trim_matches(['[', ']']).to_string(),
        }
    }

    /// Sets the body and keeps `Content-Length` in sync.
    pub fn set_content(&mut self, body: impl Into<Bytes>) {
        let bytes = body.into();
        self.headers.set("Content-Length", bytes.len().to_string());
        self.body = Body::Bytes(bytes);
    }

    /// Sets the body along with its media type.
    pub fn set_content_with_type(&mut self, body: impl Into<Bytes>, content_type: &str) {
        self.set_content(body);
        self.headers.set("Content-Type", content_type);
    }

    pub fn has_content(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// `Content-Length` as advertised by the headers.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length")?.trim().parse().ok()
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(self.body.as_bytes())
            .map_err(|e| Error::Parse(format!("invalid json body: {e}")))
    }

    /// Adds a URI parameter (query parameter or router capture). Captures
    /// are inserted at the front so they win ambiguous lookups.
    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.push((name.into(), value.into()));
    }

    pub(crate) fn add_capture(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(0, (name.into(), value.into()));
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Typed parameter lookup; `default` when absent or unparsable.
    pub fn param_or<T: FromStr>(&self, name: &str, default: T) -> T {
        self.param(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Regenerates the query string from the current parameters.
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", url::encode(k), url::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Rewrites the raw query from the current parameters.
    pub fn refresh_uri(&mut self) {
        if self.params.is_empty() {
            self.query = None;
        } else {
            self.query = Some(self.query_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_request() {
        let req = Request::new();
        assert_eq!(req.method(), Method::Unknown);
        assert_eq!(req.port(), 80);
        assert!(req.is_default_port());
        assert!(!req.is_secure());
        assert!(!req.has_content());
    }

    #[test]
    fn parse_http_url() {
        let mut req = Request::new();
        req.set_url("http://example.com/path").unwrap();
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.port(), 80);
        assert_eq!(req.scheme(), Scheme::Http);
        assert_eq!(req.uri(), "/path");
    }

    #[test]
    fn parse_https_url_with_port() {
        let mut req = Request::new();
        req.set_url("https://example.com:8443/api/v1").unwrap();
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.port(), 8443);
        assert!(req.is_secure());
        assert!(!req.is_default_port());
    }

    #[test]
    fn parse_url_with_query() {
        let mut req = Request::new();
        req.set_url("http://example.com/search?q=test&lang=en").unwrap();
        assert_eq!(req.uri(), "/search?q=test&lang=en");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.param("q"), Some("test"));
        assert_eq!(req.param("lang"), Some("en"));
    }

    #[test]
    fn rejects_bad_urls() {
        let mut req = Request::new();
        assert!(req.set_url("example.com/nope").is_err());
        assert!(req.set_url("ftp://example.com/").is_err());
        assert!(req.set_url("http://").is_err());
        assert!(req.set_url("http://host:notaport/").is_err());
    }

    #[test]
    fn uri_vs_path() {
        let mut req = Request::new();
        for (uri, path) in [
            ("/api/users", "/api/users"),
            ("/api/users?page=1&limit=10", "/api/users"),
            ("/search?q=hello%20world", "/search"),
            ("/test?", "/test"),
            ("/", "/"),
            ("/?key=value", "/"),
        ] {
            req.set_uri(uri);
            assert_eq!(req.uri(), uri);
            assert_eq!(req.path(), path);
        }
    }

    #[test]
    fn default_ports() {
        let mut req = Request::new();
        req.set_host("api.example.com");
        req.set_port(8080);
        assert!(!req.is_default_port());

        req.set_port(80);
        req.set_scheme(Scheme::Http);
        assert!(req.is_default_port());

        req.set_port(443);
        req.set_scheme(Scheme::Https);
        assert!(req.is_default_port());
    }

    #[test]
    fn content_updates_headers() {
        let mut req = Request::new();
        req.set_content("test body");
        assert!(req.has_content());
        assert_eq!(req.header("Content-Length"), Some("9"));

        req.set_content_with_type(r#"{"key":"value"}"#, "application/json");
        assert_eq!(req.header("Content-Type"), Some("application/json"));
        assert_eq!(req.header("Content-Length"), Some("15"));
    }

    #[test]
    fn typed_params() {
        let mut req = Request::new();
        req.set_uri("/api/users");
        req.add_param("page", "1");
        req.add_param("limit", "10");
        assert_eq!(req.param_or("page", 0), 1);
        assert_eq!(req.param_or("limit", 0), 10);
        assert_eq!(req.param_or("missing", 42), 42);

        let q = req.query_string();
        assert!(q.contains("page=1"));
        assert!(q.contains("limit=10"));
    }

    #[test]
    fn url_reconstruction() {
        let mut req = Request::new();
        req.set_scheme(Scheme::Https);
        req.set_host("api.example.com");
        req.set_port(443);
        req.set_uri("/v1/users");
        assert_eq!(req.url(), "https://api.example.com/v1/users");

        let mut req = Request::new();
        req.set_host("localhost");
        req.set_port(8080);
        req.set_uri("/api");
        assert_eq!(req.url(), "http://localhost:8080/api");
    }

    #[test]
    fn host_header_applies_port() {
        let mut req = Request::new();
        req.apply_host("example.com:8080");
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.port(), 8080);

        req.apply_host("plain.example.com");
        assert_eq!(req.host(), "plain.example.com");
    }
}
