//! HTTP server: listeners, route registration and lifecycle.
//!
//! ```no_run
//! use kindling::server::Server;
//!
//! let mut server = Server::new();
//! server.get("/", |res: kindling::server::Responder| async move {
//!     res.send("Hello");
//! });
//! server.listen("0.0.0.0", 8080).unwrap();
//! server.wait();
//! ```

mod conn;
mod handler;
mod request;
mod responder;
mod router;
mod sse;

pub use handler::Handler;
pub use request::Request;
pub use responder::{Responder, StreamWriter};
pub use router::{AuthLevel, Credentials, Route, Router};
pub use sse::SseConnection;

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::http::Method;
use crate::net::Socket;
use crate::runtime::Workers;
use crate::{Error, Result};

use conn::{serve_connection, ServeConfig};

/// How long [`Server::wait`] lets live connections drain after a stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// An HTTP/1.1 server with routing, WebSocket, SSE, streaming bodies and
/// TLS.
///
/// Routes and configuration are mutable until [`listen`](Server::listen);
/// the compiled router is snapshotted at that point and read-only from
/// then on.
pub struct Server {
    router: Router,
    config: ServeConfig,
    max_listening_attempts: usize,
    workers: Option<Arc<Workers>>,
    owns_workers: bool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    listening: Arc<AtomicBool>,
    local_port: Arc<AtomicU16>,
    stopped: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// A standalone server running its own private worker pool.
    pub fn new() -> Server {
        Server {
            router: Router::new(),
            config: ServeConfig::default(),
            max_listening_attempts: 1,
            workers: None,
            owns_workers: true,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            listening: Arc::new(AtomicBool::new(false)),
            local_port: Arc::new(AtomicU16::new(0)),
            stopped: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// A server distributing connections over an existing pool.
    pub fn with_workers(workers: Arc<Workers>) -> Server {
        let mut server = Server::new();
        server.workers = Some(workers);
        server.owns_workers = false;
        server
    }

    // ---- route registration ------------------------------------------

    /// Registers a route for an explicit method. The returned [`Route`]
    /// allows chaining `.deferred()` and `.auth(...)`.
    pub fn route<H, T>(&mut self, method: Method, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        let idx = self.router.add(method, pattern, handler.erased());
        self.router.route_mut(idx)
    }

    pub fn get<H, T>(&mut self, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        self.route(Method::Get, pattern, handler)
    }

    pub fn post<H, T>(&mut self, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put<H, T>(&mut self, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        self.route(Method::Put, pattern, handler)
    }

    pub fn patch<H, T>(&mut self, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        self.route(Method::Patch, pattern, handler)
    }

    pub fn delete<H, T>(&mut self, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        self.route(Method::Delete, pattern, handler)
    }

    pub fn options<H, T>(&mut self, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        self.route(Method::Options, pattern, handler)
    }

    pub fn head<H, T>(&mut self, pattern: &str, handler: H) -> &mut Route
    where
        H: Handler<T>,
    {
        self.route(Method::Head, pattern, handler)
    }

    /// Handler for requests no route matches. Defaults to a stock 404.
    pub fn set_not_found_handler<H, T>(&mut self, handler: H)
    where
        H: Handler<T>,
    {
        self.router.set_fallback(handler.erased());
    }

    // ---- configuration -----------------------------------------------

    /// Injects CORS headers on every response and short-circuits
    /// preflight `OPTIONS` requests.
    pub fn enable_cors(&mut self, enabled: bool) {
        self.router.set_cors(enabled);
    }

    /// Guards every path under `prefix` with basic authentication.
    pub fn set_basic_auth(
        &mut self,
        prefix: &str,
        realm: &str,
        credentials: impl Into<Credentials>,
    ) {
        self.router.add_basic_auth(prefix, realm, credentials.into());
    }

    /// Principals satisfying [`AuthLevel::Admin`] routes. Defaults to
    /// `["admin"]`.
    pub fn set_admin_users(&mut self, users: Vec<String>) {
        self.router.set_admin_users(users);
    }

    /// Cap on buffered request bodies for non-deferred routes (default
    /// 1 MiB). Exceeding it yields 413.
    pub fn set_max_body_size(&mut self, bytes: usize) {
        self.config.max_body_size = bytes;
    }

    /// Cap on a request head (default 1 MiB). Exceeding it yields 431.
    pub fn set_max_header_size(&mut self, bytes: usize) {
        self.config.max_head_size = bytes;
    }

    /// Idle keep-alive timeout (default 60 s).
    pub fn set_keep_alive_timeout(&mut self, timeout: Duration) {
        self.config.keep_alive_timeout = timeout;
    }

    /// Enables or disables outbound compression (default on).
    pub fn set_compression(&mut self, enabled: bool) {
        self.config.compression = enabled;
    }

    /// Minimum body size for outbound compression (default 200 bytes).
    pub fn set_compression_threshold(&mut self, bytes: usize) {
        self.config.compression_threshold = bytes;
    }

    /// Cap on reassembled WebSocket messages (default 16 MiB).
    pub fn set_max_ws_message_size(&mut self, bytes: usize) {
        self.config.max_ws_message_size = bytes;
    }

    /// Bind attempts before [`listen`](Server::listen) gives up
    /// (default 1, one second apart).
    pub fn set_max_listening_attempts(&mut self, attempts: usize) {
        self.max_listening_attempts = attempts.max(1);
    }

    // ---- lifecycle ---------------------------------------------------

    /// Binds and starts accepting plain TCP connections. Returns once the
    /// listener is live; traffic is served on the worker pool.
    pub fn listen(&mut self, host: &str, port: u16) -> Result<()> {
        self.listen_inner(host, port, None)
    }

    /// Binds a TLS listener; the handshake runs per connection with the
    /// supplied (externally loaded) certificate configuration.
    pub fn listen_tls(
        &mut self,
        host: &str,
        port: u16,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<()> {
        self.listen_inner(host, port, Some(TlsAcceptor::from(tls)))
    }

    fn listen_inner(
        &mut self,
        host: &str,
        port: u16,
        tls: Option<TlsAcceptor>,
    ) -> Result<()> {
        let mut attempt = 0;
        let listener = loop {
            attempt += 1;
            match std::net::TcpListener::bind((host, port)) {
                Ok(listener) => break listener,
                Err(e) if attempt < self.max_listening_attempts => {
                    warn!(host, port, error = %e, attempt, "bind failed, retrying");
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(Error::Bind(format!("{host}:{port}: {e}"))),
            }
        };
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Bind(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| Error::Bind(e.to_string()))?
            .port();

        let workers = self.ensure_workers()?;
        let router = Arc::new(std::mem::take(&mut self.router));
        let config = Arc::new(self.config.clone());
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        let accept_workers = workers.clone();

        workers.next_handle()?.spawn(async move {
            let listener = match tokio::net::TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, "listener registration failed");
                    return;
                }
            };
            accept_loop(listener, tls, accept_workers, router, config, cancel, tracker).await;
        });

        self.local_port.store(local_port, Ordering::SeqCst);
        self.listening.store(true, Ordering::SeqCst);
        info!(host, port = local_port, "listening");
        Ok(())
    }

    /// Binds a Unix-domain socket listener.
    #[cfg(unix)]
    pub fn listen_unix(&mut self, path: &str) -> Result<()> {
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path)
            .map_err(|e| Error::Bind(format!("{path}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Bind(e.to_string()))?;

        let workers = self.ensure_workers()?;
        let router = Arc::new(std::mem::take(&mut self.router));
        let config = Arc::new(self.config.clone());
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        let accept_workers = workers.clone();
        let path = path.to_string();

        workers.next_handle()?.spawn(async move {
            let listener = match tokio::net::UnixListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, "listener registration failed");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let socket = Socket::from_unix(stream);
                            spawn_connection(
                                socket,
                                &accept_workers,
                                router.clone(),
                                config.clone(),
                                &cancel,
                                &tracker,
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            info!(path = %path, "unix listener stopped");
        });

        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_workers(&mut self) -> Result<Arc<Workers>> {
        let workers = self
            .workers
            .get_or_insert_with(|| Arc::new(Workers::new()));
        workers.start()?;
        Ok(workers.clone())
    }

    /// The bound port; `0` before a successful [`listen`](Server::listen).
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Initiates graceful shutdown: accepts stop immediately, every
    /// connection's cancel token fires, idle connections close now and
    /// busy ones may finish their in-flight response. Returns without
    /// waiting; pair with [`wait`](Server::wait) to drain.
    ///
    /// Callable from inside handlers.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.listening.store(false, Ordering::SeqCst);
        let (lock, cvar) = &*self.stopped;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    /// Blocks until [`stop`](Server::stop) runs, then drains connections
    /// (bounded) and tears the private worker pool down.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.stopped;
        let mut stopped = lock.lock().unwrap();
        while !*stopped {
            stopped = cvar.wait(stopped).unwrap();
        }
        drop(stopped);
        self.drain();
    }

    /// Like [`wait`](Server::wait), but gives up after `timeout`.
    /// Returns `false` when the server was still running.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let (lock, cvar) = &*self.stopped;
        let mut stopped = lock.lock().unwrap();
        while !*stopped {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
            else {
                return false;
            };
            let (guard, result) = cvar.wait_timeout(stopped, remaining).unwrap();
            stopped = guard;
            if result.timed_out() && !*stopped {
                return false;
            }
        }
        drop(stopped);
        self.drain();
        true
    }

    fn drain(&self) {
        let deadline = std::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.tracker.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        if self.owns_workers {
            if let Some(workers) = &self.workers {
                workers.stop();
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_connection(
    socket: Socket,
    workers: &Arc<Workers>,
    router: Arc<Router>,
    config: Arc<ServeConfig>,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) {
    let peer = socket.id().to_string();
    let conn_cancel = cancel.child_token();
    let handle = match workers.next_handle() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "no worker available");
            return;
        }
    };
    // pins the connection to one loop for its lifetime
    tracker.spawn_on(
        serve_connection(Box::new(socket), peer, router, config, conn_cancel),
        &handle,
    );
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    tls: Option<TlsAcceptor>,
    workers: Arc<Workers>,
    router: Arc<Router>,
    config: Arc<ServeConfig>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => match &tls {
                    None => {
                        spawn_connection(
                            Socket::from_tcp(stream),
                            &workers,
                            router.clone(),
                            config.clone(),
                            &cancel,
                            &tracker,
                        );
                    }
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        let workers = workers.clone();
                        let router = router.clone();
                        let config = config.clone();
                        let cancel = cancel.clone();
                        let tracker = tracker.clone();
                        // handshake off the accept path so a slow client
                        // cannot stall other accepts
                        tokio::spawn(async move {
                            match Socket::accept_tls(stream, acceptor).await {
                                Ok(socket) => spawn_connection(
                                    socket, &workers, router, config, &cancel, &tracker,
                                ),
                                Err(e) => warn!(error = %e, "tls handshake failed"),
                            }
                        });
                    }
                },
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    info!("listener stopped");
}
