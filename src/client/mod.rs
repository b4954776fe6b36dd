//! HTTP client: a blocking [`Client`] running its own private event loop
//! and an [`AsyncClient`] registered with the shared worker pool.
//!
//! ```no_run
//! use kindling::client::Client;
//!
//! let client = Client::new();
//! let response = client.get("http://example.com/");
//! if response.ok() {
//!     println!("{}", response.text());
//! } else {
//!     eprintln!("failed: {}", response.error());
//! }
//! ```

mod builder;
mod cookies;
mod engine;
mod form;
mod pool;
mod response;
mod stream;

pub use builder::{AsyncRequestBuilder, RequestBuilder};
pub use cookies::{Cookie, CookieStore};
pub use form::{mime_type, Form};
pub use response::ClientResponse;
pub use stream::{StreamInfo, StreamResult};

use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::http::Method;
use crate::runtime::{self, Workers};
use crate::ws::{CloseCode, Message, WebSocket};
use crate::{Error, Result};

use engine::{ClientConfig, ClientCore, RequestParts};

macro_rules! config_accessors {
    () => {
        /// Per-request deadline (default 30 s).
        pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
            self.config.timeout = timeout;
            self
        }

        pub fn get_timeout(&self) -> Duration {
            self.config.timeout
        }

        /// Redirect-chain cap (default 5).
        pub fn max_redirects(&mut self, max: usize) -> &mut Self {
            self.config.max_redirects = max;
            self
        }

        pub fn get_max_redirects(&self) -> usize {
            self.config.max_redirects
        }

        /// Whether 3xx responses are followed (default true).
        pub fn follow_redirects(&mut self, follow: bool) -> &mut Self {
            self.config.follow_redirects = follow;
            self
        }

        pub fn get_follow_redirects(&self) -> bool {
            self.config.follow_redirects
        }

        /// The `User-Agent` sent when none is set explicitly.
        pub fn user_agent(&mut self, agent: impl Into<String>) -> &mut Self {
            self.config.user_agent = agent.into();
            self
        }

        pub fn get_user_agent(&self) -> &str {
            &self.config.user_agent
        }

        /// When enabled (default), `Accept-Encoding: gzip, deflate` is
        /// sent and compressed responses are decoded transparently.
        pub fn auto_decompress(&mut self, enabled: bool) -> &mut Self {
            self.config.auto_decompress = enabled;
            self
        }

        pub fn get_auto_decompress(&self) -> bool {
            self.config.auto_decompress
        }

        /// TLS certificate verification (default on).
        pub fn verify_ssl(&mut self, verify: bool) -> &mut Self {
            self.config.verify_ssl = verify;
            self
        }

        pub fn get_verify_ssl(&self) -> bool {
            self.config.verify_ssl
        }
    };
}

/// A blocking HTTP client. Every call runs a private single-threaded
/// event loop to completion; the shared worker pool is never touched.
pub struct Client {
    core: Arc<ClientCore>,
    config: ClientConfig,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates a client with its own event loop.
    ///
    /// # Panics
    ///
    /// Panics if the loop cannot be created (process resource limits).
    pub fn new() -> Client {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build client event loop");
        Client {
            core: Arc::new(ClientCore::new()),
            config: ClientConfig::default(),
            runtime: Arc::new(runtime),
        }
    }

    config_accessors!();

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn parts(&self, method: Method, url: &str) -> RequestParts {
        RequestParts::new(method, url, self.config.clone())
    }

    pub(crate) fn execute_parts(&self, parts: RequestParts) -> ClientResponse {
        self.runtime.block_on(engine::execute(&self.core, parts))
    }

    pub(crate) fn execute_stream_parts<F>(&self, parts: RequestParts, on_chunk: F) -> StreamResult
    where
        F: FnMut(&StreamInfo<'_>) -> bool + Send,
    {
        self.runtime
            .block_on(engine::execute_stream(&self.core, parts, on_chunk))
    }

    pub(crate) fn download_parts<F>(
        &self,
        parts: RequestParts,
        path: &Path,
        mut progress: F,
    ) -> StreamResult
    where
        F: FnMut(u64, u64) + Send,
    {
        let mut file = match std::fs::File::create(path) {
            Ok(file) => file,
            Err(e) => {
                return StreamResult {
                    error: format!("cannot create {}: {e}", path.display()),
                    ..Default::default()
                }
            }
        };
        let mut write_error = None;
        let result = self.execute_stream_parts(parts, |info| {
            if let Err(e) = file.write_all(info.data) {
                write_error = Some(e.to_string());
                return false;
            }
            progress(info.downloaded, info.total);
            true
        });
        match write_error {
            Some(error) if result.error.is_empty() => StreamResult { error, ..result },
            _ => result,
        }
    }

    /// Issues a GET request.
    pub fn get(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Get, url))
    }

    /// Issues a GET request, streaming the body through `on_chunk`.
    pub fn get_stream<F>(&self, url: &str, on_chunk: F) -> StreamResult
    where
        F: FnMut(&StreamInfo<'_>) -> bool + Send,
    {
        self.execute_stream_parts(self.parts(Method::Get, url), on_chunk)
    }

    pub fn post(&self, url: &str, body: impl Into<Bytes>, content_type: &str) -> ClientResponse {
        let mut parts = self.parts(Method::Post, url);
        parts.body = Some(body.into());
        parts.content_type = Some(content_type.to_string());
        self.execute_parts(parts)
    }

    pub fn put(&self, url: &str, body: impl Into<Bytes>, content_type: &str) -> ClientResponse {
        let mut parts = self.parts(Method::Put, url);
        parts.body = Some(body.into());
        parts.content_type = Some(content_type.to_string());
        self.execute_parts(parts)
    }

    pub fn patch(&self, url: &str, body: impl Into<Bytes>, content_type: &str) -> ClientResponse {
        let mut parts = self.parts(Method::Patch, url);
        parts.body = Some(body.into());
        parts.content_type = Some(content_type.to_string());
        self.execute_parts(parts)
    }

    pub fn delete(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Delete, url))
    }

    pub fn head(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Head, url))
    }

    pub fn options(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Options, url))
    }

    /// Starts composing a request.
    pub fn request<'c>(&'c self, url: &str) -> RequestBuilder<'c> {
        RequestBuilder::new(self, url)
    }

    /// Downloads `url` into `path`, reporting `(downloaded, total)`
    /// progress per chunk. `total` is `0` for chunked transfers.
    pub fn download<F>(&self, url: &str, path: impl AsRef<Path>, progress: F) -> StreamResult
    where
        F: FnMut(u64, u64) + Send,
    {
        self.download_parts(self.parts(Method::Get, url), path.as_ref(), progress)
    }

    /// Opens a WebSocket connection (`ws://`, `wss://`, or their HTTP
    /// aliases).
    pub fn websocket(&self, url: &str) -> Result<WebSocketClient> {
        let inner = self
            .runtime
            .block_on(engine::websocket(&self.config, url))?;
        Ok(WebSocketClient {
            inner,
            runtime: self.runtime.clone(),
        })
    }
}

/// Blocking wrapper over a client [`WebSocket`], driven by the owning
/// [`Client`]'s event loop.
pub struct WebSocketClient {
    inner: WebSocket,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl WebSocketClient {
    pub fn send(&mut self, msg: impl Into<Message>) -> Result<()> {
        let msg = msg.into();
        self.runtime.block_on(self.inner.send(msg))
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.send(Message::from(data))
    }

    /// Receives the next message; `None` once the connection is closed.
    pub fn recv(&mut self) -> Option<Message> {
        self.runtime.block_on(self.inner.recv())
    }

    /// Receives with a deadline; `Ok(None)` means closed, an `Err` means
    /// the deadline elapsed with the connection still up.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.runtime
            .block_on(async {
                tokio::time::timeout(timeout, self.inner.recv()).await
            })
            .map_err(|_| Error::Timeout)
    }

    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.runtime.block_on(self.inner.close(code, reason))
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn close_code(&self) -> Option<u16> {
        self.inner.close_code()
    }
}

/// An asynchronous HTTP client registered with the shared worker pool:
/// creating the first async client starts the pool, dropping the last
/// stops it.
pub struct AsyncClient {
    core: Arc<ClientCore>,
    config: ClientConfig,
    workers: Arc<Workers>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl AsyncClient {
    /// Creates the client and registers it with the shared runtime.
    pub fn new() -> Result<AsyncClient> {
        let workers = runtime::register_client()?;
        Ok(AsyncClient {
            core: Arc::new(ClientCore::new()),
            config: ClientConfig::default(),
            workers,
            pending: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        })
    }

    config_accessors!();

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn core(&self) -> &ClientCore {
        &self.core
    }

    fn parts(&self, method: Method, url: &str) -> RequestParts {
        RequestParts::new(method, url, self.config.clone())
    }

    pub(crate) async fn execute_parts(&self, parts: RequestParts) -> ClientResponse {
        let url = parts.url.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => ClientResponse::from_error(&Error::Cancelled, url),
            response = engine::execute(&self.core, parts) => response,
        }
    }

    pub async fn get(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Get, url)).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        content_type: &str,
    ) -> ClientResponse {
        let mut parts = self.parts(Method::Post, url);
        parts.body = Some(body.into());
        parts.content_type = Some(content_type.to_string());
        self.execute_parts(parts).await
    }

    pub async fn put(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        content_type: &str,
    ) -> ClientResponse {
        let mut parts = self.parts(Method::Put, url);
        parts.body = Some(body.into());
        parts.content_type = Some(content_type.to_string());
        self.execute_parts(parts).await
    }

    pub async fn patch(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        content_type: &str,
    ) -> ClientResponse {
        let mut parts = self.parts(Method::Patch, url);
        parts.body = Some(body.into());
        parts.content_type = Some(content_type.to_string());
        self.execute_parts(parts).await
    }

    pub async fn delete(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Delete, url)).await
    }

    pub async fn head(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Head, url)).await
    }

    pub async fn options(&self, url: &str) -> ClientResponse {
        self.execute_parts(self.parts(Method::Options, url)).await
    }

    /// Starts composing a request with async terminators.
    pub fn request<'c>(&'c self, url: &str) -> AsyncRequestBuilder<'c> {
        AsyncRequestBuilder::new(self, url)
    }

    /// Streams a GET response through `on_chunk`.
    pub async fn get_stream<F>(&self, url: &str, on_chunk: F) -> StreamResult
    where
        F: FnMut(&StreamInfo<'_>) -> bool + Send,
    {
        engine::execute_stream(&self.core, self.parts(Method::Get, url), on_chunk).await
    }

    /// Opens a WebSocket connection.
    pub async fn websocket(&self, url: &str) -> Result<WebSocket> {
        engine::websocket(&self.config, url).await
    }

    /// Fire-and-forget GET: runs on one of the shared loops and delivers
    /// the response to `callback`. Tracked by
    /// [`pending_requests`](AsyncClient::pending_requests).
    pub fn get_with<F>(&self, url: &str, callback: F)
    where
        F: FnOnce(ClientResponse) + Send + 'static,
    {
        self.spawn_request(self.parts(Method::Get, url), callback);
    }

    /// Fire-and-forget POST with a body.
    pub fn post_with<F>(
        &self,
        url: &str,
        body: impl Into<Bytes>,
        content_type: &str,
        callback: F,
    ) where
        F: FnOnce(ClientResponse) + Send + 'static,
    {
        let mut parts = self.parts(Method::Post, url);
        parts.body = Some(body.into());
        parts.content_type = Some(content_type.to_string());
        self.spawn_request(parts, callback);
    }

    fn spawn_request<F>(&self, parts: RequestParts, callback: F)
    where
        F: FnOnce(ClientResponse) + Send + 'static,
    {
        let core = self.core.clone();
        let cancel = self.cancel.clone();
        let guard = PendingGuard::arm(&self.pending);
        let handle = match self.workers.next_handle() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "no worker loop available");
                callback(ClientResponse::from_error(&e, parts.url));
                return;
            }
        };
        handle.spawn(async move {
            let url = parts.url.clone();
            let response = tokio::select! {
                _ = cancel.cancelled() => ClientResponse::from_error(&Error::Cancelled, url),
                response = engine::execute(&core, parts) => response,
            };
            callback(response);
            drop(guard);
        });
    }

    /// Spawns an arbitrary future onto one of the shared loops.
    pub fn run<F>(&self, future: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.workers.next_handle()?.spawn(future);
        Ok(())
    }

    /// Requests issued through the callback terminators that have not
    /// delivered yet.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Blocks until every pending request delivered.
    pub fn wait(&self) {
        while self.pending_requests() > 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Waits up to `timeout` for pending requests to deliver. Returns
    /// `false` when some are still in flight; nothing is cancelled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.pending_requests() > 0 {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Cancels every in-flight request; their callbacks observe a
    /// `cancelled` transport error.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        runtime::deregister_client();
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn arm(counter: &Arc<AtomicUsize>) -> PendingGuard {
        counter.fetch_add(1, Ordering::SeqCst);
        PendingGuard(counter.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
