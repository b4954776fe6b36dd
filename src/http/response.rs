use bytes::Bytes;

use super::{Body, HeaderMap, StatusCode};

/// An HTTP response, parsed from the wire or authored by the server.
#[derive(Debug, Clone, Default)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            ..Default::default()
        }
    }

    /// A stock reply carrying a minimal HTML body, used for errors the
    /// pipeline generates itself (404, 413, 500, ...). Statuses that forbid
    /// a body stay empty.
    pub fn stock(status: StatusCode) -> Self {
        let mut res = Response::new(status);
        if status.allows_body() {
            res.set_content_with_type(
                format!(
                    "<html><head><title>{code} {reason}</title></head>\
                     <body><h1>{code} {reason}</h1></body></html>",
                    code = status.as_u16(),
                    reason = status.reason(),
                ),
                "text/html",
            );
        }
        res
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
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

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    /// `Content-Length` as advertised by the headers.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length")?.trim().parse().ok()
    }

    /// Whether this response asks for the connection to be closed.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("Connection", "close")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_reply_has_html_body() {
        let res = Response::stock(StatusCode::NotFound);
        assert_eq!(res.status(), StatusCode::NotFound);
        assert_eq!(res.content_type(), Some("text/html"));
        let body = std::str::from_utf8(res.body_bytes()).unwrap();
        assert!(body.contains("404 Not Found"));
        assert_eq!(res.content_length(), Some(res.body_bytes().len() as u64));
    }

    #[test]
    fn stock_reply_for_bodyless_status() {
        let res = Response::stock(StatusCode::NoContent);
        assert!(!res.has_content());
        assert!(res.header("Content-Length").is_none());
    }

    #[test]
    fn connection_close_detection() {
        let mut res = Response::new(StatusCode::Ok);
        assert!(!res.wants_close());
        res.set_header("Connection", "close");
        assert!(res.wants_close());
    }
}
