//! The per-connection pipeline.
//!
//! One task per connection drives the full state machine: read a head,
//! dispatch, run the handler (pumping its write queue concurrently so
//! streaming/SSE writes flow while it executes), emit the response, then
//! loop for keep-alive or close. WebSocket upgrades detach the socket and
//! never return here.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::responder::{Outcome, Responder, WriteCmd};
use super::router::{AuthLevel, AuthOutcome, Router};
use super::Request;
use crate::compression::{self, Encoding};
use crate::http::codec::{self, BodyFraming, ChunkDecoder};
use crate::http::{Body, Method, Request as HttpRequest, Response, StatusCode};
use crate::net::Transport;
use crate::ws::WebSocket;
use crate::{Error, Result};

/// Connection-level limits and policies, snapshotted at server start.
#[derive(Debug, Clone)]
pub(crate) struct ServeConfig {
    pub max_body_size: usize,
    pub max_head_size: usize,
    pub keep_alive_timeout: Duration,
    pub compression: bool,
    pub compression_threshold: usize,
    pub max_ws_message_size: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            max_body_size: 1024 * 1024,
            max_head_size: codec::DEFAULT_MAX_HEAD_BYTES,
            keep_alive_timeout: Duration::from_secs(60),
            compression: true,
            compression_threshold: compression::DEFAULT_THRESHOLD,
            max_ws_message_size: crate::ws::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Remaining wire body of the current request.
pub(crate) enum BodyRemaining {
    None,
    Length(u64),
    Chunked {
        decoder: ChunkDecoder,
        pending: BytesMut,
    },
}

/// The buffered read side of a connection. Shared with the request during
/// deferred-body handling; the pipeline reacquires it afterwards.
pub(crate) struct ReadSource {
    io: ReadHalf<Box<dyn Transport>>,
    pub(crate) buf: BytesMut,
    pub(crate) body: BodyRemaining,
}

pub(crate) type SharedReader = Arc<tokio::sync::Mutex<ReadSource>>;

impl ReadSource {
    fn new(io: ReadHalf<Box<dyn Transport>>) -> ReadSource {
        ReadSource {
            io,
            buf: BytesMut::with_capacity(8 * 1024),
            body: BodyRemaining::None,
        }
    }

    async fn fill(&mut self) -> Result<usize> {
        if self.buf.capacity() - self.buf.len() < 4 * 1024 {
            self.buf.reserve(codec::READ_CHUNK);
        }
        Ok(self.io.read_buf(&mut self.buf).await?)
    }

    pub(crate) fn has_pending_body(&self) -> bool {
        match &self.body {
            BodyRemaining::None => false,
            BodyRemaining::Length(n) => *n > 0,
            BodyRemaining::Chunked { decoder, pending } => {
                !pending.is_empty() || !decoder.is_done()
            }
        }
    }

    /// Reads up to `out.len()` decoded body bytes; `0` at end-of-body.
    /// Never pulls more from the socket than the caller asked for, which
    /// is what gives deferred handlers TCP backpressure.
    pub(crate) async fn read_body(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.body {
                BodyRemaining::None => return Ok(0),
                BodyRemaining::Length(remaining) => {
                    if *remaining == 0 {
                        return Ok(0);
                    }
                    if !self.buf.is_empty() {
                        let take = out
                            .len()
                            .min(self.buf.len())
                            .min(*remaining as usize);
                        out[..take].copy_from_slice(&self.buf[..take]);
                        let _ = self.buf.split_to(take);
                        *remaining -= take as u64;
                        return Ok(take);
                    }
                }
                BodyRemaining::Chunked { decoder, pending } => {
                    if !pending.is_empty() {
                        let take = out.len().min(pending.len());
                        out[..take].copy_from_slice(&pending[..take]);
                        let _ = pending.split_to(take);
                        return Ok(take);
                    }
                    if decoder.is_done() {
                        return Ok(0);
                    }
                    if !self.buf.is_empty() {
                        decoder.decode(&mut self.buf, pending)?;
                        if !pending.is_empty() || decoder.is_done() {
                            continue;
                        }
                    }
                }
            }
            if self.fill().await? == 0 {
                return Err(Error::PeerClosed);
            }
        }
    }

    /// Buffers the whole body, bounded by `max`. A `Content-Length` beyond
    /// the bound fails before reading a single byte.
    pub(crate) async fn read_full_body(&mut self, max: usize) -> Result<Bytes> {
        if let BodyRemaining::Length(n) = &self.body {
            if *n > max as u64 {
                return Err(Error::LimitExceeded("request body".into()));
            }
        }
        let mut out = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = self.read_body(&mut chunk).await?;
            if n == 0 {
                return Ok(Bytes::from(out));
            }
            out.extend_from_slice(&chunk[..n]);
            if out.len() > max {
                return Err(Error::LimitExceeded("request body".into()));
            }
        }
    }

    /// Discards the remaining body, bounded by `max`.
    pub(crate) async fn drain_body(&mut self, max: usize) -> Result<()> {
        let mut chunk = vec![0u8; 16 * 1024];
        let mut total = 0usize;
        loop {
            let n = self.read_body(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            total += n;
            if total > max {
                return Err(Error::LimitExceeded("unread request body".into()));
            }
        }
    }
}

enum Action {
    Handle {
        handler: super::handler::ArcHandler,
        deferred: bool,
        auth: AuthLevel,
        captures: Vec<(String, String)>,
    },
    Simple(Response),
}

/// Entry point: drives one accepted connection to completion.
pub(crate) async fn serve_connection(
    stream: Box<dyn Transport>,
    peer: String,
    router: Arc<Router>,
    config: Arc<ServeConfig>,
    cancel: CancellationToken,
) {
    match drive(stream, &peer, router, config, cancel).await {
        Ok(()) => trace!(peer = %peer, "connection finished"),
        Err(e) if e.is_peer_closed() => trace!(peer = %peer, "peer closed"),
        Err(e) => debug!(peer = %peer, error = %e, "connection error"),
    }
}

async fn drive(
    stream: Box<dyn Transport>,
    peer: &str,
    router: Arc<Router>,
    config: Arc<ServeConfig>,
    cancel: CancellationToken,
) -> Result<()> {
    let (rd, mut wr) = tokio::io::split(stream);
    let reader: SharedReader = Arc::new(tokio::sync::Mutex::new(ReadSource::new(rd)));

    loop {
        // ---- read the next request head ------------------------------
        let head = {
            let mut src = reader.lock().await;
            match read_head(&mut src, &config, &cancel).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => {
                    drop(src);
                    let status = match &e {
                        Error::LimitExceeded(_) => StatusCode::RequestHeaderFieldsTooLarge,
                        Error::Timeout => StatusCode::RequestTimeout,
                        _ => StatusCode::BadRequest,
                    };
                    let _ =
                        write_response(&mut wr, &router, Response::stock(status), false, false)
                            .await;
                    return Err(e);
                }
            }
        };

        let http10 = head.version == 0;
        let mut http_req = match codec::request_from_head(head) {
            Ok(req) => req,
            Err(e) => {
                let _ = write_response(
                    &mut wr,
                    &router,
                    Response::stock(StatusCode::BadRequest),
                    false,
                    false,
                )
                .await;
                return Err(e);
            }
        };
        let framing = match codec::request_framing(http_req.headers_mut()) {
            Ok(framing) => framing,
            Err(e) => {
                let _ = write_response(
                    &mut wr,
                    &router,
                    Response::stock(StatusCode::BadRequest),
                    false,
                    false,
                )
                .await;
                return Err(e);
            }
        };
        {
            let mut src = reader.lock().await;
            src.body = match framing {
                BodyFraming::None | BodyFraming::UntilClose => BodyRemaining::None,
                BodyFraming::Length(n) => BodyRemaining::Length(n),
                BodyFraming::Chunked => BodyRemaining::Chunked {
                    decoder: ChunkDecoder::new(),
                    pending: BytesMut::new(),
                },
            };
        }

        let req_close = http_req.headers().has_token("Connection", "close")
            || (http10 && !http_req.headers().has_token("Connection", "keep-alive"));
        let mut keep_alive = !req_close;

        let method = http_req.method();
        let is_head = method == Method::Head;
        let path = http_req.path().to_string();
        trace!(peer = %peer, %method, path = %path, "request");

        // ---- routing + auth ------------------------------------------
        let mut action = match router.find(method, &path) {
            Some(m) => Action::Handle {
                handler: m.route.handler.clone(),
                deferred: m.route.deferred,
                auth: m.route.auth,
                captures: m.captures,
            },
            None if method == Method::Options && router.cors_enabled() => {
                Action::Simple(Response::new(StatusCode::NoContent))
            }
            None => match router.fallback() {
                Some(fallback) => Action::Handle {
                    handler: fallback.clone(),
                    deferred: false,
                    auth: AuthLevel::None,
                    captures: Vec::new(),
                },
                None => Action::Simple(Response::stock(StatusCode::NotFound)),
            },
        };

        let mut auth_user = None;
        if let Action::Handle { auth, .. } = &action {
            match router.authenticate(&http_req, *auth) {
                AuthOutcome::Allowed(user) => auth_user = user,
                AuthOutcome::Denied(realm) => {
                    let mut res = Response::stock(StatusCode::Unauthorized);
                    res.set_header("WWW-Authenticate", format!("Basic realm=\"{realm}\""));
                    action = Action::Simple(res);
                }
            }
        }

        let deferred = matches!(
            action,
            Action::Handle { deferred: true, .. }
        );

        // ---- body (eager mode) ---------------------------------------
        if !deferred {
            let body = {
                let mut src = reader.lock().await;
                src.read_full_body(config.max_body_size).await
            };
            let body = match body {
                Ok(body) => body,
                Err(Error::LimitExceeded(_)) => {
                    let _ = write_response(
                        &mut wr,
                        &router,
                        Response::stock(StatusCode::PayloadTooLarge),
                        false,
                        is_head,
                    )
                    .await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let body = if matches!(action, Action::Handle { .. }) {
                inbound_decode(&mut http_req, body, &config)
            } else {
                Ok(body)
            };
            let body = match body {
                Ok(body) => body,
                Err(InboundReject::TooLarge) => {
                    let _ = write_response(
                        &mut wr,
                        &router,
                        Response::stock(StatusCode::PayloadTooLarge),
                        false,
                        is_head,
                    )
                    .await;
                    return Ok(());
                }
                Err(InboundReject::Malformed) => {
                    let _ = write_response(
                        &mut wr,
                        &router,
                        Response::stock(StatusCode::BadRequest),
                        false,
                        is_head,
                    )
                    .await;
                    return Ok(());
                }
                Err(InboundReject::Unsupported) => {
                    action = Action::Simple(Response::stock(StatusCode::UnsupportedMediaType));
                    Bytes::new()
                }
            };
            if !body.is_empty() {
                http_req
                    .headers_mut()
                    .set("Content-Length", body.len().to_string());
                http_req.headers_mut().remove("Transfer-Encoding");
                http_req.set_body(Body::from(body));
            }
        }

        // ---- execute -------------------------------------------------
        match action {
            Action::Simple(res) => {
                let keep = keep_alive && !res.wants_close() && !cancel.is_cancelled();
                write_response(&mut wr, &router, res, keep, is_head).await?;
                if !keep {
                    return Ok(());
                }
            }
            Action::Handle {
                handler, captures, ..
            } => {
                for (name, value) in captures {
                    http_req.add_capture(name, value);
                }
                let head_snapshot = Arc::new(http_req.clone());
                let request = Request::new(
                    http_req,
                    deferred.then(|| reader.clone()),
                    auth_user,
                    peer.to_string(),
                );
                let (tx, mut rx) = mpsc::unbounded_channel();
                let (responder, staged) = Responder::new(
                    head_snapshot.clone(),
                    tx,
                    router.clone(),
                    config.max_ws_message_size,
                );

                let mut rx_open = true;
                let mut stream_ended = false;
                let panicked = {
                    let fut = std::panic::AssertUnwindSafe(handler(request, responder))
                        .catch_unwind();
                    tokio::pin!(fut);
                    loop {
                        if rx_open {
                            tokio::select! {
                                result = &mut fut => break result.is_err(),
                                cmd = rx.recv() => match cmd {
                                    None => rx_open = false,
                                    Some(WriteCmd::End) => stream_ended = true,
                                    Some(WriteCmd::Data(bytes, ack)) => {
                                        wr.write_all(&bytes).await?;
                                        wr.flush().await?;
                                        if let Some(ack) = ack {
                                            let _ = ack.send(());
                                        }
                                    }
                                },
                            }
                        } else {
                            break fut.as_mut().await.is_err();
                        }
                    }
                };
                if panicked {
                    warn!(peer = %peer, path = %path, "handler panicked");
                }

                let outcome = {
                    let mut staged = staged.lock().unwrap();
                    std::mem::replace(&mut staged.outcome, Outcome::Pending)
                };

                match outcome {
                    Outcome::Pending => {
                        // no response was produced; per policy this is a
                        // handler failure: 500 and close
                        let _ = write_response(
                            &mut wr,
                            &router,
                            Response::stock(StatusCode::InternalServerError),
                            false,
                            is_head,
                        )
                        .await;
                        return Ok(());
                    }
                    Outcome::Response(res) => {
                        let mut res = if panicked {
                            Response::stock(StatusCode::InternalServerError)
                        } else {
                            res
                        };
                        if !panicked {
                            maybe_compress(&head_snapshot, &mut res, &config);
                        }
                        let keep = keep_alive
                            && !panicked
                            && !res.wants_close()
                            && !cancel.is_cancelled();
                        write_response(&mut wr, &router, res, keep, is_head).await?;
                        if !drain_leftover(&reader, &config).await {
                            return Ok(());
                        }
                        if !keep {
                            return Ok(());
                        }
                    }
                    Outcome::Streaming => {
                        while rx_open && !stream_ended {
                            tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                cmd = rx.recv() => match cmd {
                                    None => rx_open = false,
                                    Some(WriteCmd::End) => stream_ended = true,
                                    Some(WriteCmd::Data(bytes, ack)) => {
                                        wr.write_all(&bytes).await?;
                                        wr.flush().await?;
                                        if let Some(ack) = ack {
                                            let _ = ack.send(());
                                        }
                                    }
                                },
                            }
                        }
                        keep_alive = keep_alive
                            && stream_ended
                            && !panicked
                            && !cancel.is_cancelled();
                        if !drain_leftover(&reader, &config).await {
                            return Ok(());
                        }
                        if !keep_alive {
                            return Ok(());
                        }
                    }
                    Outcome::Sse => {
                        let mut open = rx_open && !stream_ended;
                        while open {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                cmd = rx.recv() => match cmd {
                                    None | Some(WriteCmd::End) => open = false,
                                    Some(WriteCmd::Data(bytes, ack)) => {
                                        if wr.write_all(&bytes).await.is_err()
                                            || wr.flush().await.is_err()
                                        {
                                            open = false;
                                        }
                                        if let Some(ack) = ack {
                                            let _ = ack.send(());
                                        }
                                    }
                                },
                            }
                        }
                        return Ok(());
                    }
                    Outcome::Upgrade { response, callback } => {
                        let head = codec::encode_response_head(&response, false);
                        wr.write_all(&head).await?;
                        wr.flush().await?;

                        let source = Arc::try_unwrap(reader)
                            .map_err(|_| {
                                Error::Handler("request escaped the handler scope".into())
                            })?
                            .into_inner();
                        let stream = source.io.unsplit(wr);
                        let ws =
                            WebSocket::server(stream, source.buf, config.max_ws_message_size);
                        debug!(peer = %peer, path = %path, "websocket upgrade");
                        callback(ws).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn read_head(
    src: &mut ReadSource,
    config: &ServeConfig,
    cancel: &CancellationToken,
) -> Result<Option<codec::RequestHead>> {
    loop {
        if let Some((head, consumed)) = codec::parse_request_head(&src.buf, config.max_head_size)? {
            let _ = src.buf.split_to(consumed);
            return Ok(Some(head));
        }
        let idle = src.buf.is_empty();
        tokio::select! {
            _ = cancel.cancelled() => {
                // idle keep-alive connections close immediately on stop;
                // a half-read head is abandoned the same way
                return Ok(None);
            }
            filled = tokio::time::timeout(config.keep_alive_timeout, src.fill()) => {
                match filled {
                    Err(_) if idle => return Ok(None),
                    Err(_) => return Err(Error::Timeout),
                    Ok(Ok(0)) if idle => return Ok(None),
                    Ok(Ok(0)) => return Err(Error::PeerClosed),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e),
                }
            }
        }
    }
}

enum InboundReject {
    TooLarge,
    Malformed,
    Unsupported,
}

/// Transparently decompresses a request body per `Content-Encoding`.
fn inbound_decode(
    req: &mut HttpRequest,
    body: Bytes,
    config: &ServeConfig,
) -> std::result::Result<Bytes, InboundReject> {
    let Some(coding) = req.header("Content-Encoding").map(str::to_string) else {
        return Ok(body);
    };
    if coding.eq_ignore_ascii_case("identity") {
        return Ok(body);
    }
    let Some(encoding) = Encoding::from_token(&coding) else {
        return Err(InboundReject::Unsupported);
    };
    if body.is_empty() {
        return Ok(body);
    }
    match compression::decompress(&body, encoding, config.max_body_size) {
        Ok(plain) => {
            req.headers_mut().remove("Content-Encoding");
            Ok(Bytes::from(plain))
        }
        Err(Error::LimitExceeded(_)) => Err(InboundReject::TooLarge),
        Err(_) => Err(InboundReject::Malformed),
    }
}

/// Compresses an outbound response when policy and negotiation allow it.
fn maybe_compress(req: &HttpRequest, res: &mut Response, config: &ServeConfig) {
    if !config.compression
        || !res.status().allows_body()
        || res.body().len() < config.compression_threshold
        || res.headers().contains("Content-Encoding")
    {
        return;
    }
    let Some(encoding) = compression::negotiate(req.headers()) else {
        return;
    };
    if let Ok(packed) = compression::compress(res.body_bytes(), encoding) {
        res.headers_mut().set("Content-Encoding", encoding.as_str());
        res.headers_mut()
            .set("Content-Length", packed.len().to_string());
        res.set_body(Body::from(packed));
    }
}

/// Discards an unread deferred-body remainder so the parser stays in sync
/// for the next request. `false` means the connection must close.
async fn drain_leftover(reader: &SharedReader, config: &ServeConfig) -> bool {
    let mut src = reader.lock().await;
    if !src.has_pending_body() {
        return true;
    }
    src.drain_body(config.max_body_size).await.is_ok()
}

async fn write_response<W: AsyncWrite + Unpin>(
    wr: &mut W,
    router: &Router,
    mut res: Response,
    keep_alive: bool,
    is_head: bool,
) -> Result<()> {
    router.apply_cors(&mut res);
    if !keep_alive {
        res.headers_mut().set("Connection", "close");
    }
    let head = codec::encode_response_head(&res, false);
    wr.write_all(&head).await?;
    if !is_head && res.status().allows_body() {
        wr.write_all(res.body_bytes()).await?;
    }
    wr.flush().await?;
    Ok(())
}
