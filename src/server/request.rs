use std::ops::{Deref, DerefMut};

use super::conn::SharedReader;
use crate::http::Request as HttpRequest;
use crate::Result;

/// A request as seen by server handlers.
///
/// Dereferences to [`http::Request`](crate::http::Request) for headers,
/// URI parameters and the buffered body. On deferred routes the body is
/// not buffered; the handler pulls it through [`read`](Request::read).
pub struct Request {
    inner: HttpRequest,
    reader: Option<SharedReader>,
    auth_user: Option<String>,
    peer: String,
}

impl Request {
    pub(crate) fn new(
        inner: HttpRequest,
        reader: Option<SharedReader>,
        auth_user: Option<String>,
        peer: String,
    ) -> Request {
        Request {
            inner,
            reader,
            auth_user,
            peer,
        }
    }

    /// The principal authenticated by basic auth, if any.
    pub fn auth_user(&self) -> Option<&str> {
        self.auth_user.as_deref()
    }

    /// Diagnostics identifier of the peer socket.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether this request is in deferred-body mode.
    pub fn is_deferred(&self) -> bool {
        self.reader.is_some()
    }

    /// Pulls up to `buf.len()` body bytes from the connection.
    ///
    /// Only reads from the socket on demand, so TCP backpressure applies:
    /// the pipeline never consumes faster than the handler asks. Chunked
    /// transfers are crossed transparently. Returns `0` once the body is
    /// fully consumed, and `0` immediately on non-deferred routes (their
    /// body is already buffered on the request).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(reader) = &self.reader else {
            return Ok(0);
        };
        let mut source = reader.lock().await;
        source.read_body(buf).await
    }

    /// The underlying message.
    pub fn http(&self) -> &HttpRequest {
        &self.inner
    }
}

impl Deref for Request {
    type Target = HttpRequest;

    fn deref(&self) -> &HttpRequest {
        &self.inner
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut HttpRequest {
        &mut self.inner
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method())
            .field("uri", &self.inner.uri())
            .field("peer", &self.peer)
            .field("deferred", &self.reader.is_some())
            .finish()
    }
}
