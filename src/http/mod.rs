//! HTTP/1.1 data model and wire codec.
//!
//! The types here are shared by the server and the client: [`Request`] and
//! [`Response`] messages over an insertion-ordered [`HeaderMap`], with the
//! incremental head parser and body framing in [`codec`].

pub mod codec;
mod headers;
mod method;
mod request;
mod response;
mod status;
pub mod url;

pub use headers::HeaderMap;
pub use method::Method;
pub use request::{Request, Scheme};
pub use response::Response;
pub use status::StatusCode;

use bytes::Bytes;

/// A message body.
///
/// Parsed messages always carry [`Body::Empty`] or [`Body::Bytes`]; bounded
/// and chunked *streams* are a property of the connection (the pipeline
/// reads them on demand) and never materialize here unless fully buffered.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Bytes(b) => b,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Bytes(b) => b,
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(b)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}
