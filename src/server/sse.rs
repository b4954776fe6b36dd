//! Server-Sent Events per the WHATWG EventSource wire format.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::responder::{WriteCmd, WriteTx};
use crate::http::codec;
use crate::{Error, Result};

/// Writer for one SSE channel, returned by
/// [`Responder::start_sse`](super::Responder::start_sse).
///
/// Clonable and sendable across tasks, so broadcast sets can hold handles
/// to many live channels. Events written on one connection preserve write
/// order. Every method queues a chunk; errors mean the peer is gone or the
/// channel was closed.
#[derive(Clone)]
pub struct SseConnection {
    tx: WriteTx,
    closed: Arc<AtomicBool>,
}

impl SseConnection {
    pub(crate) fn new(tx: WriteTx) -> SseConnection {
        SseConnection {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn send_raw(&self, text: String) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PeerClosed);
        }
        self.tx
            .send(WriteCmd::Data(codec::encode_chunk(text.as_bytes()), None))
            .map_err(|_| Error::PeerClosed)
    }

    /// Queues a `data:` field. Multi-line payloads become one `data:` line
    /// per line; the terminating blank line dispatches the event.
    pub fn send_data(&self, data: &str) -> Result<()> {
        let mut out = String::with_capacity(data.len() + 16);
        for line in data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.trim_end_matches('\r'));
            out.push('\n');
        }
        out.push('\n');
        self.send_raw(out)
    }

    /// Queues an `event:` name for the next data field.
    pub fn send_event(&self, name: &str) -> Result<()> {
        self.send_raw(format!("event: {name}\n"))
    }

    /// Queues an `id:` field.
    pub fn send_id(&self, id: &str) -> Result<()> {
        self.send_raw(format!("id: {id}\n"))
    }

    /// Queues a `retry:` reconnection hint in milliseconds.
    pub fn send_retry(&self, millis: u64) -> Result<()> {
        self.send_raw(format!("retry: {millis}\n"))
    }

    /// Queues a comment line (ignored by EventSource; useful as a
    /// keep-alive probe).
    pub fn comment(&self, text: &str) -> Result<()> {
        self.send_raw(format!(": {text}\n\n"))
    }

    /// Terminates the channel: emits the final chunk and releases the
    /// connection. Affects every clone of this handle.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(WriteCmd::Data(
            Bytes::from_static(codec::FINAL_CHUNK),
            None,
        ));
        let _ = self.tx.send(WriteCmd::End);
    }

    /// Whether [`close`](SseConnection::close) ran or the peer vanished.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

impl std::fmt::Debug for SseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}
