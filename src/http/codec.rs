//! Incremental HTTP/1.1 head parsing and body framing.
//!
//! Heads are parsed with `httparse` over a growing buffer: callers feed the
//! accumulated bytes and get back `None` until a full head is buffered.
//! Body framing (content-length, chunked, read-to-close) and serialization
//! live here as well; the connection pipeline and the client both drive
//! these primitives.

use bytes::{Bytes, BytesMut};
use memchr::memchr;

use super::{HeaderMap, Method, Request, Response, StatusCode};
use crate::{Error, Result};

/// Upper bound on distinct header lines per message.
pub const MAX_HEADERS: usize = 100;

/// Default cap on the size of a message head (431 past this).
pub const DEFAULT_MAX_HEAD_BYTES: usize = 1024 * 1024;

/// Read granularity used by the pipeline when filling parse buffers.
pub const READ_CHUNK: usize = 64 * 1024;

/// Terminal chunk of a chunked body.
pub const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

const MAX_CHUNK_SIZE_LINE: usize = 128;

/// A parsed request head: the request line plus headers, body untouched.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    /// Minor HTTP version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    pub headers: HeaderMap,
}

/// A parsed response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Minor HTTP version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    pub headers: HeaderMap,
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    parsed
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

/// Tries to parse a request head out of `buf`.
///
/// Returns `Ok(None)` while the head is still incomplete, or
/// `Ok(Some((head, consumed)))` once the terminating CRLF CRLF is buffered.
/// A head larger than `max_head` fails with [`Error::LimitExceeded`].
pub fn parse_request_head(buf: &[u8], max_head: usize) -> Result<Option<(RequestHead, usize)>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let head = RequestHead {
                method: Method::from(parsed.method.unwrap_or("")),
                target: parsed.path.unwrap_or("/").to_string(),
                version: parsed.version.unwrap_or(1),
                headers: collect_headers(parsed.headers),
            };
            Ok(Some((head, consumed)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_head {
                Err(Error::LimitExceeded("request head".into()))
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Tries to parse a response head out of `buf`. Same contract as
/// [`parse_request_head`].
pub fn parse_response_head(buf: &[u8], max_head: usize) -> Result<Option<(ResponseHead, usize)>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let head = ResponseHead {
                status: StatusCode::from_u16(parsed.code.unwrap_or(0)),
                version: parsed.version.unwrap_or(1),
                headers: collect_headers(parsed.headers),
            };
            Ok(Some((head, consumed)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_head {
                Err(Error::LimitExceeded("response head".into()))
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Builds a [`Request`] from a parsed head, applying the `Host` header and
/// resolving origin-form or absolute-form targets.
pub fn request_from_head(head: RequestHead) -> Result<Request> {
    let mut req = Request::new();
    req.set_method(head.method);
    if head.target.starts_with('/') {
        req.set_uri(&head.target);
    } else if head.target.contains("://") {
        req.set_url(&head.target)?;
    } else {
        return Err(Error::Parse(format!(
            "unsupported request target {:?}",
            head.target
        )));
    }
    let host = head.headers.get("Host").map(str::to_string);
    *req.headers_mut() = head.headers;
    if let Some(host) = host {
        req.apply_host(&host);
    }
    Ok(req)
}

/// Builds a [`Response`] shell (headers, status) from a parsed head.
pub fn response_from_head(head: ResponseHead) -> Response {
    let mut res = Response::new(head.status);
    *res.headers_mut() = head.headers;
    res
}

/// How the body of a message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    None,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// The body extends until the peer closes (responses only).
    UntilClose,
}

fn transfer_encoding_chunked(headers: &HeaderMap) -> Result<Option<bool>> {
    if !headers.contains("Transfer-Encoding") {
        return Ok(None);
    }
    let tokens = headers.tokens("Transfer-Encoding");
    match tokens.last().map(String::as_str) {
        Some("chunked") => Ok(Some(true)),
        _ => Err(Error::Parse("unsupported transfer coding".into())),
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all("Content-Length") {
        for part in value.split(',') {
            let parsed: u64 = part
                .trim()
                .parse()
                .map_err(|_| Error::Parse(format!("invalid content-length {part:?}")))?;
            match length {
                None => length = Some(parsed),
                Some(existing) if existing == parsed => {}
                Some(_) => {
                    return Err(Error::Parse("conflicting content-length values".into()));
                }
            }
        }
    }
    Ok(length)
}

/// Determines request body framing, resolving the `Transfer-Encoding` vs
/// `Content-Length` conflict per RFC 7230 §3.3.3 (chunked wins, the
/// content-length header is removed).
pub fn request_framing(headers: &mut HeaderMap) -> Result<BodyFraming> {
    if transfer_encoding_chunked(headers)?.unwrap_or(false) {
        headers.remove("Content-Length");
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::None),
        Some(n) => Ok(BodyFraming::Length(n)),
    }
}

/// Determines response body framing. `head_request` suppresses the body for
/// responses to HEAD; absent framing headers mean read-until-close.
pub fn response_framing(
    headers: &mut HeaderMap,
    status: StatusCode,
    head_request: bool,
) -> Result<BodyFraming> {
    if head_request || !status.allows_body() {
        return Ok(BodyFraming::None);
    }
    if transfer_encoding_chunked(headers)?.unwrap_or(false) {
        headers.remove("Content-Length");
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyFraming::None),
        Some(n) => Ok(BodyFraming::Length(n)),
        None => Ok(BodyFraming::UntilClose),
    }
}

/// Incremental decoder for `Transfer-Encoding: chunked` payloads.
///
/// Feed arbitrary slices of the wire stream; decoded payload bytes are
/// appended to `out`. Chunk extensions are ignored and trailers are
/// consumed and discarded.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkState,
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        ChunkDecoder {
            state: ChunkState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Decodes as much as `src` allows, moving payload bytes into `out`.
    /// Returns `true` once the terminal chunk and trailers are consumed.
    pub fn decode(&mut self, src: &mut BytesMut, out: &mut BytesMut) -> Result<bool> {
        loop {
            match &mut self.state {
                ChunkState::Size => {
                    let line = match take_line(src, MAX_CHUNK_SIZE_LINE)? {
                        Some(line) => line,
                        None => return Ok(false),
                    };
                    let hex = line
                        .split(|b| *b == b';')
                        .next()
                        .unwrap_or(&line[..]);
                    let size = parse_hex(hex)?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(false);
                    }
                    let take = (*remaining).min(src.len() as u64) as usize;
                    out.extend_from_slice(&src.split_to(take));
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    }
                }
                ChunkState::DataEnd => {
                    if src.len() < 2 {
                        return Ok(false);
                    }
                    let crlf = src.split_to(2);
                    if &crlf[..] != b"\r\n" {
                        return Err(Error::Parse("missing chunk terminator".into()));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let line = match take_line(src, DEFAULT_MAX_HEAD_BYTES)? {
                        Some(line) => line,
                        None => return Ok(false),
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                        return Ok(true);
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

/// Splits one CRLF-terminated line off `src`, excluding the terminator.
/// `None` while the line is incomplete; errors when the pending line
/// exceeds `max` or a bare LF shows up.
fn take_line(src: &mut BytesMut, max: usize) -> Result<Option<Bytes>> {
    match memchr(b'\n', src) {
        Some(0) => Err(Error::Parse("bare LF in chunked framing".into())),
        Some(idx) => {
            if src[idx - 1] != b'\r' {
                return Err(Error::Parse("bare LF in chunked framing".into()));
            }
            let line = src.split_to(idx + 1).freeze();
            Ok(Some(line.slice(..idx - 1)))
        }
        None => {
            if src.len() > max {
                Err(Error::LimitExceeded("chunk size line".into()))
            } else {
                Ok(None)
            }
        }
    }
}

fn parse_hex(input: &[u8]) -> Result<u64> {
    let trimmed: Vec<u8> = input
        .iter()
        .copied()
        .skip_while(u8::is_ascii_whitespace)
        .take_while(|b| !b.is_ascii_whitespace())
        .collect();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(Error::Parse("invalid chunk size".into()));
    }
    let mut value: u64 = 0;
    for b in trimmed {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(Error::Parse("invalid chunk size".into())),
        };
        value = value
            .checked_mul(16)
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or_else(|| Error::Parse("invalid chunk size".into()))?;
    }
    Ok(value)
}

/// Encodes one chunk of a chunked body.
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// Serializes a request head. A missing `Host` header is synthesized from
/// the request's host and port; every outbound request carries one.
pub fn encode_request_head(req: &Request) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(req.method().as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(req.uri().as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    if !req.headers().contains("Host") {
        if req.host().is_empty() {
            return Err(Error::InvalidUrl("request has no host".into()));
        }
        if req.is_default_port() {
            buf.extend_from_slice(format!("Host: {}\r\n", req.host()).as_bytes());
        } else {
            buf.extend_from_slice(format!("Host: {}:{}\r\n", req.host(), req.port()).as_bytes());
        }
    }

    let has_body = req.has_content();
    let mut has_length = false;
    for (name, value) in req.headers() {
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
        {
            has_length = true;
        }
        buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if has_body && !has_length {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", req.body().len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

/// Serializes a response head.
///
/// When `streaming` the head advertises `Transfer-Encoding: chunked` and
/// drops any `Content-Length`; otherwise a missing `Content-Length` is
/// synthesized from the buffered body so keep-alive responses are always
/// delimited. Statuses that forbid a body never emit either header.
pub fn encode_response_head(res: &Response, streaming: bool) -> BytesMut {
    let status = res.status();
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(
        format!("HTTP/1.1 {:03} {}\r\n", status.as_u16(), status.reason()).as_bytes(),
    );

    let body_allowed = status.allows_body();
    let mut has_length = false;
    let mut has_chunked = false;
    for (name, value) in res.headers() {
        if name.eq_ignore_ascii_case("Content-Length") {
            if !body_allowed || streaming {
                continue;
            }
            has_length = true;
        }
        if name.eq_ignore_ascii_case("Transfer-Encoding") {
            if !body_allowed {
                continue;
            }
            has_chunked = true;
        }
        buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if body_allowed {
        if streaming {
            if !has_chunked {
                buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
            }
        } else if !has_length && !has_chunked {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", res.body().len()).as_bytes());
        }
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Serializes a full buffered response: head plus body.
pub fn encode_response(res: &Response) -> BytesMut {
    let mut buf = encode_response_head(res, false);
    if res.status().allows_body() {
        buf.extend_from_slice(res.body_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::super::Body;
    use super::*;

    #[test]
    fn parse_request_incrementally() {
        let wire = b"GET /index.html?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        for split in 0..wire.len() {
            let partial = parse_request_head(&wire[..split], 1024).unwrap();
            assert!(partial.is_none(), "complete head at {split} bytes?");
        }
        let (head, consumed) = parse_request_head(wire, 1024).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.target, "/index.html?x=1");
        assert_eq!(head.headers.get("host"), Some("example.com"));
    }

    #[test]
    fn parse_rejects_oversized_head() {
        let mut wire = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        wire.extend(std::iter::repeat(b'a').take(4096));
        let err = parse_request_head(&wire, 1024).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_request_head(b"GET \x01 HTTP/1.1\r\n\r\n", 1024).is_err());
    }

    #[test]
    fn request_from_head_applies_host() {
        let wire = b"GET /a/b HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let (head, _) = parse_request_head(wire, 1024).unwrap().unwrap();
        let req = request_from_head(head).unwrap();
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.port(), 8080);
        assert_eq!(req.path(), "/a/b");
    }

    #[test]
    fn parse_response_head_basics() {
        let wire = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let (head, consumed) = parse_response_head(wire, 1024).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(head.status, StatusCode::NotFound);
    }

    #[test]
    fn framing_content_length() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Length", "42");
        assert_eq!(
            request_framing(&mut headers).unwrap(),
            BodyFraming::Length(42)
        );
    }

    #[test]
    fn framing_chunked_wins_over_length() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Length", "42");
        headers.set("Transfer-Encoding", "chunked");
        assert_eq!(request_framing(&mut headers).unwrap(), BodyFraming::Chunked);
        assert!(!headers.contains("Content-Length"));
    }

    #[test]
    fn framing_rejects_conflicting_lengths() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Length", "42");
        headers.append("Content-Length", "17");
        assert!(request_framing(&mut headers).is_err());

        let mut headers = HeaderMap::new();
        headers.append("Content-Length", "42");
        headers.append("Content-Length", "42");
        assert_eq!(
            request_framing(&mut headers).unwrap(),
            BodyFraming::Length(42)
        );
    }

    #[test]
    fn framing_response_until_close() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            response_framing(&mut headers, StatusCode::Ok, false).unwrap(),
            BodyFraming::UntilClose
        );
        assert_eq!(
            response_framing(&mut headers, StatusCode::NoContent, false).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            response_framing(&mut headers, StatusCode::Ok, true).unwrap(),
            BodyFraming::None
        );
    }

    #[test]
    fn chunk_decoder_whole_body() {
        let mut src = BytesMut::from(&b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n"[..]);
        let mut out = BytesMut::new();
        let mut dec = ChunkDecoder::new();
        assert!(dec.decode(&mut src, &mut out).unwrap());
        assert_eq!(&out[..], b"Hello World");
        assert!(src.is_empty());
    }

    #[test]
    fn chunk_decoder_byte_at_a_time() {
        let wire = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nTrailer: x\r\n\r\n";
        let mut dec = ChunkDecoder::new();
        let mut src = BytesMut::new();
        let mut out = BytesMut::new();
        let mut done = false;
        for &b in wire.iter() {
            src.extend_from_slice(&[b]);
            done = dec.decode(&mut src, &mut out).unwrap();
        }
        assert!(done);
        assert_eq!(&out[..], b"Wikipedia in\r\n\r\nchunks.");
    }

    #[test]
    fn chunk_decoder_rejects_bad_terminator() {
        let mut src = BytesMut::from(&b"5\r\nHelloXX"[..]);
        let mut out = BytesMut::new();
        let mut dec = ChunkDecoder::new();
        assert!(dec.decode(&mut src, &mut out).is_err());
    }

    #[test]
    fn encode_request_synthesizes_host_and_length() {
        let mut req = Request::build(Method::Post, "http://example.com/api/test").unwrap();
        req.headers_mut().append("User-Agent", "TestClient");
        req.set_body(Body::from("hello"));
        let head = encode_request_head(&req).unwrap();
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("POST /api/test HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("User-Agent: TestClient\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_response_plain() {
        let mut res = Response::new(StatusCode::Ok);
        res.set_content_with_type("Hello", "text/plain");
        let bytes = encode_response(&res);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn encode_response_204_has_no_length() {
        let mut res = Response::new(StatusCode::NoContent);
        res.headers_mut().set("Content-Length", "0");
        let head = encode_response_head(&res, false);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn encode_response_streaming_is_chunked() {
        let res = Response::new(StatusCode::Ok);
        let head = encode_response_head(&res, true);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn encode_unknown_status_line() {
        let res = Response::new(StatusCode::Unknown);
        let head = encode_response_head(&res, false);
        assert!(head.starts_with(b"HTTP/1.1 000 Unknown Status\r\n"));
    }

    #[test]
    fn chunk_encoding() {
        assert_eq!(&encode_chunk(b"Hello")[..], b"5\r\nHello\r\n");
        assert_eq!(&encode_chunk(&[0u8; 16])[..8], b"10\r\n\0\0\0\0");
        assert_eq!(FINAL_CHUNK, b"0\r\n\r\n");
    }
}
