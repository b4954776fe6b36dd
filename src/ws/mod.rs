//! WebSocket connections (RFC 6455).
//!
//! A [`WebSocket`] is handed to the user after a successful upgrade:
//! server side through [`Responder::upgrade_websocket`], client side
//! through [`Client::websocket`]. `recv` yields complete, reassembled
//! messages; ping/pong and the close handshake are handled internally, and
//! `recv` returning `None` is the single close notification.
//!
//! [`Responder::upgrade_websocket`]: crate::server::Responder::upgrade_websocket
//! [`Client::websocket`]: crate::client::Client::websocket

pub mod frame;
pub mod handshake;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::net::Transport;
use crate::{Error, Result};
use frame::{Frame, OpCode, Role};

/// Default cap on a reassembled message: 16 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            Message::Binary(_) => None,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(s) => Bytes::from(s),
            Message::Binary(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(s) => s.len(),
            Message::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

/// Close codes this crate recognizes; anything else travels as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    Away,
    /// 1002
    Protocol,
    /// 1003
    Unsupported,
    /// 1007
    Invalid,
    /// 1008
    Policy,
    /// 1009
    TooBig,
    /// 1011
    Internal,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::Internal => 1011,
            CloseCode::Other(code) => *code,
        }
    }

    pub fn from_u16(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::TooBig,
            1011 => CloseCode::Internal,
            other => CloseCode::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsState {
    Open,
    CloseSent,
    Closed,
}

struct Fragments {
    opcode: OpCode,
    data: BytesMut,
    utf8: Utf8Validator,
}

/// An established WebSocket connection.
pub struct WebSocket {
    stream: Box<dyn Transport>,
    buf: BytesMut,
    role: Role,
    max_message_size: usize,
    state: WsState,
    close_code: Option<u16>,
    close_reason: String,
    fragments: Option<Fragments>,
}

impl WebSocket {
    pub(crate) fn server(
        stream: impl Transport + 'static,
        leftover: BytesMut,
        max_message_size: usize,
    ) -> WebSocket {
        Self::with_role(stream, leftover, Role::Server, max_message_size)
    }

    pub(crate) fn client(
        stream: impl Transport + 'static,
        leftover: BytesMut,
        max_message_size: usize,
    ) -> WebSocket {
        Self::with_role(stream, leftover, Role::Client, max_message_size)
    }

    fn with_role(
        stream: impl Transport + 'static,
        leftover: BytesMut,
        role: Role,
        max_message_size: usize,
    ) -> WebSocket {
        WebSocket {
            stream: Box::new(stream),
            buf: leftover,
            role,
            max_message_size,
            state: WsState::Open,
            close_code: None,
            close_reason: String::new(),
            fragments: None,
        }
    }

    /// The configured reassembled-message cap.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn is_open(&self) -> bool {
        self.state == WsState::Open
    }

    /// The close code observed or sent, once the connection is closed.
    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    pub fn close_reason(&self) -> &str {
        &self.close_reason
    }

    /// Sends a complete message as a single frame.
    pub async fn send(&mut self, msg: impl Into<Message>) -> Result<()> {
        if self.state != WsState::Open {
            return Err(Error::WebSocketClosed {
                code: self.close_code.unwrap_or(1006),
                reason: self.close_reason.clone(),
            });
        }
        let frame = match msg.into() {
            Message::Text(s) => Frame::new(OpCode::Text, Bytes::from(s)),
            Message::Binary(b) => Frame::new(OpCode::Binary, b),
        };
        self.write_frame(&frame).await
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into())).await
    }

    /// Sends a ping; the peer's pong is consumed internally by `recv`.
    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let frame = Frame::new(OpCode::Ping, payload.into());
        self.write_frame(&frame).await
    }

    /// Starts the close handshake. `recv` keeps draining until the peer
    /// echoes the close frame.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if self.state != WsState::Open {
            return Ok(());
        }
        self.close_code = Some(code.as_u16());
        self.close_reason = reason.to_string();
        self.state = WsState::CloseSent;
        let frame = Frame::close(Some(code.as_u16()), reason);
        self.write_frame(&frame).await
    }

    /// Receives the next complete message. `None` means the connection is
    /// closed: by the peer, by an error (the mapped close code was sent
    /// first) or following our own [`close`](WebSocket::close).
    pub async fn recv(&mut self) -> Option<Message> {
        if self.state == WsState::Closed {
            return None;
        }
        loop {
            let frame = match self.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.state = WsState::Closed;
                    return None;
                }
                Err(Error::LimitExceeded(_)) => {
                    self.abort(CloseCode::TooBig, "message too big").await;
                    return None;
                }
                Err(Error::Parse(reason)) => {
                    self.abort(CloseCode::Protocol, &reason).await;
                    return None;
                }
                Err(_) => {
                    self.state = WsState::Closed;
                    return None;
                }
            };
            trace!(opcode = ?frame.opcode, len = frame.payload.len(), "frame received");

            match frame.opcode {
                OpCode::Ping => {
                    let pong = Frame::new(OpCode::Pong, frame.payload);
                    if self.write_frame(&pong).await.is_err() {
                        self.state = WsState::Closed;
                        return None;
                    }
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let (code, reason) = parse_close_payload(&frame.payload);
                    if self.state == WsState::Open {
                        // echo the close before shutting down
                        let echo = Frame::close(code, &reason);
                        let _ = self.write_frame(&echo).await;
                        self.close_code = code;
                        self.close_reason = reason;
                    }
                    let _ = self.stream.shutdown().await;
                    self.state = WsState::Closed;
                    return None;
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragments.is_some() {
                        self.abort(CloseCode::Protocol, "interleaved message frames").await;
                        return None;
                    }
                    if frame.fin {
                        match self.complete_message(frame.opcode, frame.payload) {
                            Ok(msg) => return Some(msg),
                            Err(code) => {
                                self.abort(code, "invalid message payload").await;
                                return None;
                            }
                        }
                    } else {
                        let mut utf8 = Utf8Validator::new();
                        if frame.opcode == OpCode::Text && !utf8.push(&frame.payload) {
                            self.abort(CloseCode::Invalid, "invalid utf-8").await;
                            return None;
                        }
                        self.fragments = Some(Fragments {
                            opcode: frame.opcode,
                            data: BytesMut::from(&frame.payload[..]),
                            utf8,
                        });
                    }
                }
                OpCode::Continuation => {
                    let Some(fragments) = self.fragments.as_mut() else {
                        self.abort(CloseCode::Protocol, "continuation without start").await;
                        return None;
                    };
                    if fragments.data.len() + frame.payload.len() > self.max_message_size {
                        self.abort(CloseCode::TooBig, "message too big").await;
                        return None;
                    }
                    if fragments.opcode == OpCode::Text && !fragments.utf8.push(&frame.payload) {
                        self.abort(CloseCode::Invalid, "invalid utf-8").await;
                        return None;
                    }
                    fragments.data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let fragments = self.fragments.take().expect("fragment state present");
                        if fragments.opcode == OpCode::Text && !fragments.utf8.finish() {
                            self.abort(CloseCode::Invalid, "invalid utf-8").await;
                            return None;
                        }
                        match self.complete_message(fragments.opcode, fragments.data.freeze()) {
                            Ok(msg) => return Some(msg),
                            Err(code) => {
                                self.abort(code, "invalid message payload").await;
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    fn complete_message(
        &mut self,
        opcode: OpCode,
        data: Bytes,
    ) -> std::result::Result<Message, CloseCode> {
        if data.len() > self.max_message_size {
            return Err(CloseCode::TooBig);
        }
        match opcode {
            OpCode::Text => match String::from_utf8(data.to_vec()) {
                Ok(text) => Ok(Message::Text(text)),
                Err(_) => Err(CloseCode::Invalid),
            },
            _ => Ok(Message::Binary(data)),
        }
    }

    /// Sends a close with `code` and shuts the socket down immediately.
    async fn abort(&mut self, code: CloseCode, reason: &str) {
        debug!(code = code.as_u16(), reason, "closing websocket");
        if self.state != WsState::Closed {
            let frame = Frame::close(Some(code.as_u16()), reason);
            let _ = self.write_frame(&frame).await;
        }
        self.close_code = Some(code.as_u16());
        self.close_reason = reason.to_string();
        let _ = self.stream.shutdown().await;
        self.state = WsState::Closed;
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            // per-frame cap mirrors the message cap so a hostile length
            // field fails before any allocation
            if let Some(frame) = frame::decode(&mut self.buf, self.role, self.max_message_size)? {
                return Ok(Some(frame));
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::PeerClosed)
                };
            }
        }
    }

    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut wire = BytesMut::new();
        frame::encode(frame, self.role, &mut wire);
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}

/// Streaming UTF-8 validation across message fragments. Keeps at most one
/// partial code point between pushes.
pub(crate) struct Utf8Validator {
    pending: Vec<u8>,
}

impl Utf8Validator {
    pub(crate) fn new() -> Self {
        Utf8Validator {
            pending: Vec::new(),
        }
    }

    /// Feeds the next fragment; `false` means the stream can never become
    /// valid UTF-8.
    pub(crate) fn push(&mut self, data: &[u8]) -> bool {
        let combined: Vec<u8> = if self.pending.is_empty() {
            data.to_vec()
        } else {
            let mut v = std::mem::take(&mut self.pending);
            v.extend_from_slice(data);
            v
        };
        match std::str::from_utf8(&combined) {
            Ok(_) => {
                self.pending.clear();
                true
            }
            Err(e) if e.error_len().is_none() => {
                self.pending = combined[e.valid_up_to()..].to_vec();
                true
            }
            Err(_) => false,
        }
    }

    /// `true` when no partial code point is outstanding.
    pub(crate) fn finish(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(max: usize) -> (WebSocket, WebSocket) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            WebSocket::client(a, BytesMut::new(), max),
            WebSocket::server(b, BytesMut::new(), max),
        )
    }

    #[tokio::test]
    async fn echo_text() {
        let (mut client, mut server) = pair(DEFAULT_MAX_MESSAGE_SIZE);
        client.send_text("Hello").await.unwrap();
        let msg = server.recv().await.unwrap();
        assert_eq!(msg, Message::Text("Hello".into()));
        assert!(!msg.is_binary());

        server.send(msg).await.unwrap();
        let echoed = client.recv().await.unwrap();
        assert_eq!(echoed.as_text(), Some("Hello"));
    }

    #[tokio::test]
    async fn binary_round_trip() {
        let (mut client, mut server) = pair(DEFAULT_MAX_MESSAGE_SIZE);
        client.send_binary(vec![0u8, 159, 146, 150]).await.unwrap();
        let msg = server.recv().await.unwrap();
        assert!(msg.is_binary());
        assert_eq!(&msg.into_bytes()[..], &[0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn ping_answers_pong_between_messages() {
        let (mut client, mut server) = pair(DEFAULT_MAX_MESSAGE_SIZE);
        client.ping(&b"tick"[..]).await.unwrap();
        client.send_text("after ping").await.unwrap();

        // server handles the ping internally and yields only the message
        let msg = server.recv().await.unwrap();
        assert_eq!(msg.as_text(), Some("after ping"));

        // the pong is consumed internally on the client as well
        server.send_text("done").await.unwrap();
        assert_eq!(client.recv().await.unwrap().as_text(), Some("done"));
    }

    #[tokio::test]
    async fn fragmented_message_reassembles() {
        let (mut client, mut server) = pair(DEFAULT_MAX_MESSAGE_SIZE);
        let parts = [
            Frame {
                fin: false,
                opcode: OpCode::Text,
                payload: Bytes::from_static(b"Hel"),
            },
            Frame {
                fin: false,
                opcode: OpCode::Continuation,
                payload: Bytes::from_static(b"lo "),
            },
            Frame {
                fin: true,
                opcode: OpCode::Continuation,
                payload: Bytes::from_static(b"World"),
            },
        ];
        for frame in &parts {
            client.write_frame(frame).await.unwrap();
        }
        assert_eq!(server.recv().await.unwrap().as_text(), Some("Hello World"));
    }

    #[tokio::test]
    async fn utf8_split_across_fragments() {
        let (mut client, mut server) = pair(DEFAULT_MAX_MESSAGE_SIZE);
        // é = 0xC3 0xA9 split across two fragments
        client
            .write_frame(&Frame {
                fin: false,
                opcode: OpCode::Text,
                payload: Bytes::from_static(&[b'J', b'o', b's', 0xc3]),
            })
            .await
            .unwrap();
        client
            .write_frame(&Frame {
                fin: true,
                opcode: OpCode::Continuation,
                payload: Bytes::from_static(&[0xa9]),
            })
            .await
            .unwrap();
        assert_eq!(server.recv().await.unwrap().as_text(), Some("José"));
    }

    #[tokio::test]
    async fn invalid_utf8_closes_1007() {
        let (mut client, mut server) = pair(DEFAULT_MAX_MESSAGE_SIZE);
        client
            .write_frame(&Frame::new(OpCode::Text, Bytes::from_static(&[0xff, 0xfe])))
            .await
            .unwrap();
        assert!(server.recv().await.is_none());
        assert_eq!(server.close_code(), Some(1007));
        // the client observes the close frame
        assert!(client.recv().await.is_none());
        assert_eq!(client.close_code(), Some(1007));
    }

    #[tokio::test]
    async fn oversized_message_closes_1009() {
        let (mut client, mut server) = pair(1024);
        client.send_binary(vec![0u8; 2048]).await.unwrap();
        assert!(server.recv().await.is_none());
        assert_eq!(server.close_code(), Some(1009));
        assert!(client.recv().await.is_none());
        assert_eq!(client.close_code(), Some(1009));
    }

    #[tokio::test]
    async fn close_handshake_echoes_code() {
        let (mut client, mut server) = pair(DEFAULT_MAX_MESSAGE_SIZE);
        client.close(CloseCode::Normal, "bye").await.unwrap();
        assert!(server.recv().await.is_none());
        assert_eq!(server.close_code(), Some(1000));
        assert_eq!(server.close_reason(), "bye");

        assert!(client.recv().await.is_none());
        assert!(!client.is_open());
        // sending after close fails
        assert!(client.send_text("late").await.is_err());
    }

    #[test]
    fn close_code_round_trip() {
        for code in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1011, 4000] {
            assert_eq!(CloseCode::from_u16(code).as_u16(), code);
        }
    }

    #[test]
    fn utf8_validator_incremental() {
        let mut v = Utf8Validator::new();
        assert!(v.push(b"Jos"));
        assert!(v.push(&[0xc3]));
        assert!(!v.finish());
        assert!(v.push(&[0xa9]));
        assert!(v.finish());

        let mut v = Utf8Validator::new();
        assert!(!v.push(&[0x80]));
    }
}
