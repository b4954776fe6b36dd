use bytes::Bytes;

use crate::http::{HeaderMap, Response, StatusCode};
use crate::{Error, Result};

/// A client-side response.
///
/// Transport failures do not raise: they produce a response whose
/// [`is_error`](ClientResponse::is_error) is true, with the textual cause
/// in [`error`](ClientResponse::error) and a status of `0`. HTTP-level
/// failures (4xx/5xx) are visible only through
/// [`status`](ClientResponse::status).
#[derive(Debug, Default)]
pub struct ClientResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    error: Option<String>,
    url: String,
}

impl ClientResponse {
    pub(crate) fn from_response(mut res: Response, url: String) -> ClientResponse {
        ClientResponse {
            status: res.status(),
            body: res.take_body().into_bytes(),
            headers: std::mem::take(res.headers_mut()),
            error: None,
            url,
        }
    }

    pub(crate) fn from_error(err: &Error, url: String) -> ClientResponse {
        ClientResponse {
            status: StatusCode::Unknown,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error: Some(err.to_string()),
            url,
        }
    }

    /// Numeric status code; `0` on transport failure.
    pub fn status(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// `true` for 2xx responses without a transport error.
    pub fn ok(&self) -> bool {
        self.error.is_none() && self.status.is_success()
    }

    /// `true` when the transport failed (the `!response` observable).
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The transport error text; empty when transport succeeded.
    pub fn error(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    /// The URL that produced this response, after redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length")?.trim().parse().ok()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as (lossily decoded) text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the media type is JSON.
    pub fn is_json(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Parse(format!("invalid json body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;

    #[test]
    fn transport_error_observables() {
        let res = ClientResponse::from_error(&Error::Timeout, "http://x/".into());
        assert!(res.is_error());
        assert!(!res.ok());
        assert_eq!(res.status(), 0);
        assert_eq!(res.error(), "timeout");
    }

    #[test]
    fn http_error_is_not_transport_error() {
        let inner = Response::stock(StatusCode::NotFound);
        let res = ClientResponse::from_response(inner, "http://x/".into());
        assert!(!res.is_error());
        assert!(!res.ok());
        assert_eq!(res.status(), 404);
        assert_eq!(res.error(), "");
    }

    #[test]
    fn json_detection() {
        let mut inner = Response::new(StatusCode::Ok);
        inner.set_content_with_type(r#"{"k":"v"}"#, "application/json; charset=utf-8");
        let res = ClientResponse::from_response(inner, String::new());
        assert!(res.ok());
        assert!(res.is_json());
        assert_eq!(res.json().unwrap()["k"], "v");
        assert_eq!(res.content_length(), Some(9));
    }
}
