use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::router::Router;
use super::sse::SseConnection;
use crate::http::{codec, Request as HttpRequest, Response, StatusCode};
use crate::ws::{handshake, WebSocket};
use crate::{Error, Result};

/// One entry in the connection's serialized write queue.
pub(crate) enum WriteCmd {
    /// Raw bytes; the ack (when present) fires once they hit the socket,
    /// giving streaming writers backpressure.
    Data(Bytes, Option<oneshot::Sender<()>>),
    /// Terminates a streaming/SSE pump.
    End,
}

pub(crate) type WriteTx = mpsc::UnboundedSender<WriteCmd>;

pub(crate) type WsCallback =
    Box<dyn FnOnce(WebSocket) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// What the handler decided to do with the connection.
pub(crate) enum Outcome {
    /// Handler produced nothing; the pipeline answers 500.
    Pending,
    /// A buffered response to emit after the handler returns.
    Response(Response),
    /// The handler streamed a chunked response through a [`StreamWriter`].
    Streaming,
    /// The handler opened an SSE channel.
    Sse,
    /// Switch protocols: send the 101 and hand the socket to the callback.
    Upgrade {
        response: Response,
        callback: WsCallback,
    },
}

pub(crate) struct Staged {
    pub outcome: Outcome,
    status: StatusCode,
}

pub(crate) type SharedStaged = Arc<Mutex<Staged>>;

/// The response surface handed to handlers.
///
/// The buffered methods (`json`, `html`, `send`, `error`, ...) stage a
/// response the pipeline emits once the handler returns. The terminal
/// methods (`start_stream`, `start_sse`, `upgrade_websocket`) consume the
/// responder and switch the connection into the corresponding mode.
pub struct Responder {
    staged: SharedStaged,
    tx: WriteTx,
    head: Arc<HttpRequest>,
    router: Arc<Router>,
    max_ws_message_size: usize,
}

impl Responder {
    pub(crate) fn new(
        head: Arc<HttpRequest>,
        tx: WriteTx,
        router: Arc<Router>,
        max_ws_message_size: usize,
    ) -> (Responder, SharedStaged) {
        let staged = Arc::new(Mutex::new(Staged {
            outcome: Outcome::Pending,
            status: StatusCode::Ok,
        }));
        (
            Responder {
                staged: staged.clone(),
                tx,
                head,
                router,
                max_ws_message_size,
            },
            staged,
        )
    }

    fn stage(&self, response: Response) {
        let mut staged = self.staged.lock().unwrap();
        staged.outcome = Outcome::Response(response);
    }

    fn staged_status(&self) -> StatusCode {
        self.staged.lock().unwrap().status
    }

    /// Sets the status used by the next buffered reply. Chainable.
    pub fn status(&self, status: StatusCode) -> &Self {
        self.staged.lock().unwrap().status = status;
        self
    }

    /// Stages a JSON reply.
    pub fn json(&self, value: &serde_json::Value) {
        self.json_with_status(value, self.staged_status());
    }

    /// Stages a JSON reply with an explicit status.
    pub fn json_with_status(&self, value: &serde_json::Value, status: StatusCode) {
        let mut res = Response::new(status);
        res.set_content_with_type(value.to_string(), "application/json");
        self.stage(res);
    }

    /// Stages an HTML reply.
    pub fn html(&self, body: impl Into<String>) {
        let mut res = Response::new(self.staged_status());
        res.set_content_with_type(body.into(), "text/html");
        self.stage(res);
    }

    /// Stages a plain-text reply.
    pub fn send(&self, body: impl Into<Bytes>) {
        self.send_with_type(body, "text/plain");
    }

    /// Stages a reply with an explicit media type.
    pub fn send_with_type(&self, body: impl Into<Bytes>, content_type: &str) {
        let mut res = Response::new(self.staged_status());
        res.set_content_with_type(body.into(), content_type);
        self.stage(res);
    }

    /// Stages an error reply with a JSON `{"error": ...}` body.
    pub fn error(&self, status: StatusCode, message: &str) {
        let mut res = Response::new(status);
        res.set_content_with_type(
            serde_json::json!({ "error": message }).to_string(),
            "application/json",
        );
        self.stage(res);
    }

    /// Stages a pre-built response.
    pub fn send_response(&self, response: Response) {
        self.stage(response);
    }

    /// Switches to chunked streaming: emits the head now and returns the
    /// chunk writer. The connection emits one chunk per `write` call.
    pub async fn start_stream(self, content_type: &str) -> Result<StreamWriter> {
        let mut res = Response::new(self.staged_status());
        res.set_header("Content-Type", content_type);
        // streaming heads bypass the pipeline's response writer, so CORS
        // injection happens here
        self.router.apply_cors(&mut res);
        let head = codec::encode_response_head(&res, true);
        {
            let mut staged = self.staged.lock().unwrap();
            staged.outcome = Outcome::Streaming;
        }
        send_with_ack(&self.tx, head.freeze()).await?;
        Ok(StreamWriter {
            tx: self.tx.clone(),
            ended: false,
        })
    }

    /// Switches to Server-Sent Events: emits the `text/event-stream` head
    /// and returns the (clonable) event writer. A cross-origin
    /// `EventSource` needs the CORS headers on this very response, so
    /// they are injected here like on every other response.
    pub async fn start_sse(self) -> Result<SseConnection> {
        let mut res = Response::new(StatusCode::Ok);
        res.set_header("Content-Type", "text/event-stream");
        res.set_header("Cache-Control", "no-cache");
        res.set_header("Connection", "keep-alive");
        self.router.apply_cors(&mut res);
        let head = codec::encode_response_head(&res, true);
        {
            let mut staged = self.staged.lock().unwrap();
            staged.outcome = Outcome::Sse;
        }
        send_with_ack(&self.tx, head.freeze()).await?;
        Ok(SseConnection::new(self.tx.clone()))
    }

    /// Validates the WebSocket upgrade and schedules the protocol switch:
    /// after the handler returns, the pipeline sends the `101` and hands
    /// the detached connection to `callback`.
    ///
    /// On a defective upgrade request a `400` is staged and the error
    /// returned.
    pub fn upgrade_websocket<F, Fut>(self, callback: F) -> Result<()>
    where
        F: FnOnce(WebSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let accept = match handshake::validate_upgrade(&self.head) {
            Ok(accept) => accept,
            Err(e) => {
                self.error(StatusCode::BadRequest, &e.to_string());
                return Err(e);
            }
        };
        let response = handshake::upgrade_response(&accept);
        let mut staged = self.staged.lock().unwrap();
        staged.outcome = Outcome::Upgrade {
            response,
            callback: Box::new(move |ws| Box::pin(callback(ws))),
        };
        Ok(())
    }

    /// The configured WebSocket message cap for upgrades on this server.
    pub fn max_ws_message_size(&self) -> usize {
        self.max_ws_message_size
    }
}

pub(crate) async fn send_with_ack(tx: &WriteTx, data: Bytes) -> Result<()> {
    let (ack_tx, ack_rx) = oneshot::channel();
    tx.send(WriteCmd::Data(data, Some(ack_tx)))
        .map_err(|_| Error::PeerClosed)?;
    ack_rx.await.map_err(|_| Error::PeerClosed)
}

/// Chunked-response writer returned by [`Responder::start_stream`].
///
/// Each `write` emits one chunk and waits until it reaches the socket.
/// Dropping the writer without calling [`end`](StreamWriter::end) emits
/// the terminal chunk automatically.
pub struct StreamWriter {
    tx: WriteTx,
    ended: bool,
}

impl StreamWriter {
    /// Emits one chunk.
    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        if self.ended {
            return Err(Error::PeerClosed);
        }
        let data = data.as_ref();
        if data.is_empty() {
            // a zero-length chunk would terminate the stream
            return Ok(());
        }
        send_with_ack(&self.tx, codec::encode_chunk(data)).await
    }

    /// Emits the terminal zero chunk and ends the stream.
    pub async fn end(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.tx
            .send(WriteCmd::Data(
                Bytes::from_static(codec::FINAL_CHUNK),
                None,
            ))
            .map_err(|_| Error::PeerClosed)?;
        self.tx.send(WriteCmd::End).map_err(|_| Error::PeerClosed)?;
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
