//! Fluent request composition.
//!
//! Builders are single-use: a terminator consumes the builder and issues
//! the request.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;

use super::engine::{self, RequestParts};
use super::form::Form;
use super::response::ClientResponse;
use super::stream::{StreamInfo, StreamResult};
use super::{AsyncClient, Client};
use crate::http::Method;

macro_rules! builder_setters {
    () => {
        /// Adds one request header.
        pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.parts.headers.append(name, value);
            self
        }

        /// Adds several request headers.
        pub fn headers<I, K, V>(mut self, headers: I) -> Self
        where
            I: IntoIterator<Item = (K, V)>,
            K: Into<String>,
            V: Into<String>,
        {
            for (name, value) in headers {
                self.parts.headers.append(name, value);
            }
            self
        }

        /// Sets a raw body and its media type.
        pub fn body(mut self, body: impl Into<Bytes>, content_type: &str) -> Self {
            self.parts.body = Some(body.into());
            self.parts.content_type = Some(content_type.to_string());
            self
        }

        /// Sets a form body (URL-encoded, or multipart when it carries
        /// files).
        pub fn form(mut self, form: Form) -> Self {
            self.parts.content_type = Some(form.content_type());
            self.parts.body = Some(Bytes::from(form.body()));
            self
        }

        /// Overrides the per-request deadline.
        pub fn timeout(mut self, timeout: Duration) -> Self {
            self.parts.config.timeout = timeout;
            self
        }

        /// Overrides TLS certificate verification for this request.
        pub fn verify_ssl(mut self, verify: bool) -> Self {
            self.parts.config.verify_ssl = verify;
            self
        }

        /// Overrides redirect following for this request.
        pub fn follow_redirects(mut self, follow: bool) -> Self {
            self.parts.config.follow_redirects = follow;
            self
        }

        /// Overrides the redirect cap for this request.
        pub fn max_redirects(mut self, max: usize) -> Self {
            self.parts.config.max_redirects = max;
            self
        }

        /// Overrides the `User-Agent` for this request.
        pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
            self.parts.config.user_agent = agent.into();
            self
        }

        /// Routes this request over a Unix-domain socket.
        pub fn unix_socket(mut self, path: impl Into<String>) -> Self {
            self.parts.unix_socket = Some(path.into());
            self
        }
    };
}

/// Builder returned by [`Client::request`].
pub struct RequestBuilder<'c> {
    client: &'c Client,
    parts: RequestParts,
}

impl<'c> RequestBuilder<'c> {
    pub(crate) fn new(client: &'c Client, url: &str) -> RequestBuilder<'c> {
        RequestBuilder {
            parts: RequestParts::new(Method::Get, url, client.config().clone()),
            client,
        }
    }

    builder_setters!();

    fn send(mut self, method: Method) -> ClientResponse {
        self.parts.method = method;
        self.client.execute_parts(self.parts)
    }

    pub fn get(self) -> ClientResponse {
        self.send(Method::Get)
    }

    pub fn post(self) -> ClientResponse {
        self.send(Method::Post)
    }

    pub fn put(self) -> ClientResponse {
        self.send(Method::Put)
    }

    pub fn patch(self) -> ClientResponse {
        self.send(Method::Patch)
    }

    pub fn delete(self) -> ClientResponse {
        self.send(Method::Delete)
    }

    pub fn head(self) -> ClientResponse {
        self.send(Method::Head)
    }

    pub fn options(self) -> ClientResponse {
        self.send(Method::Options)
    }

    /// Issues a GET, streaming the response through `on_chunk`;
    /// returning `false` aborts.
    pub fn stream<F>(mut self, on_chunk: F) -> StreamResult
    where
        F: FnMut(&StreamInfo<'_>) -> bool + Send,
    {
        self.parts.method = Method::Get;
        self.client.execute_stream_parts(self.parts, on_chunk)
    }

    /// Issues a POST (with the accumulated body), streaming the response
    /// through `on_chunk`.
    pub fn post_stream<F>(mut self, on_chunk: F) -> StreamResult
    where
        F: FnMut(&StreamInfo<'_>) -> bool + Send,
    {
        self.parts.method = Method::Post;
        self.client.execute_stream_parts(self.parts, on_chunk)
    }

    /// Downloads the response body to `path`, reporting progress.
    pub fn download<F>(mut self, path: impl AsRef<Path>, progress: F) -> StreamResult
    where
        F: FnMut(u64, u64) + Send,
    {
        self.parts.method = Method::Get;
        self.client.download_parts(self.parts, path.as_ref(), progress)
    }
}

/// Builder returned by [`AsyncClient::request`].
pub struct AsyncRequestBuilder<'c> {
    client: &'c AsyncClient,
    parts: RequestParts,
}

impl<'c> AsyncRequestBuilder<'c> {
    pub(crate) fn new(client: &'c AsyncClient, url: &str) -> AsyncRequestBuilder<'c> {
        AsyncRequestBuilder {
            parts: RequestParts::new(Method::Get, url, client.config().clone()),
            client,
        }
    }

    builder_setters!();

    async fn send(mut self, method: Method) -> ClientResponse {
        self.parts.method = method;
        self.client.execute_parts(self.parts).await
    }

    pub async fn get(self) -> ClientResponse {
        self.send(Method::Get).await
    }

    pub async fn post(self) -> ClientResponse {
        self.send(Method::Post).await
    }

    pub async fn put(self) -> ClientResponse {
        self.send(Method::Put).await
    }

    pub async fn patch(self) -> ClientResponse {
        self.send(Method::Patch).await
    }

    pub async fn delete(self) -> ClientResponse {
        self.send(Method::Delete).await
    }

    pub async fn head(self) -> ClientResponse {
        self.send(Method::Head).await
    }

    pub async fn options(self) -> ClientResponse {
        self.send(Method::Options).await
    }

    /// Issues a GET, streaming the response through `on_chunk`;
    /// returning `false` aborts.
    pub async fn stream<F>(mut self, on_chunk: F) -> StreamResult
    where
        F: FnMut(&StreamInfo<'_>) -> bool + Send,
    {
        self.parts.method = Method::Get;
        engine::execute_stream(self.client.core(), self.parts, on_chunk).await
    }

    /// Issues a POST (with the accumulated body), streaming the response
    /// through `on_chunk`.
    pub async fn post_stream<F>(mut self, on_chunk: F) -> StreamResult
    where
        F: FnMut(&StreamInfo<'_>) -> bool + Send,
    {
        self.parts.method = Method::Post;
        engine::execute_stream(self.client.core(), self.parts, on_chunk).await
    }
}
