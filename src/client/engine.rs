//! The request machinery shared by the blocking and async clients:
//! connect or reuse, serialize, parse, redirects, cookies, decompression
//! and streaming reads.

use std::sync::Mutex;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use super::cookies::CookieStore;
use super::pool::{ConnectionPool, PoolKey};
use super::response::ClientResponse;
use super::stream::{StreamInfo, StreamResult};
use crate::compression::{self, Encoding};
use crate::http::codec::{self, BodyFraming, ChunkDecoder};
use crate::http::{Body, HeaderMap, Method, Request, Response};
use crate::net::{self, Socket};
use crate::ws::{handshake, WebSocket};
use crate::{Error, Result};

/// Hard cap on buffered response bodies.
const MAX_RESPONSE_BODY: usize = 256 * 1024 * 1024;

/// Per-client configuration; snapshotted into every request.
#[derive(Debug, Clone)]
pub(crate) struct ClientConfig {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub follow_redirects: bool,
    pub user_agent: String,
    pub auto_decompress: bool,
    pub verify_ssl: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Duration::from_secs(30),
            max_redirects: 5,
            follow_redirects: true,
            user_agent: concat!("kindling/", env!("CARGO_PKG_VERSION")).to_string(),
            auto_decompress: true,
            verify_ssl: true,
        }
    }
}

/// Shared connection pool and cookie store.
#[derive(Default)]
pub(crate) struct ClientCore {
    pool: Mutex<ConnectionPool>,
    cookies: Mutex<CookieStore>,
}

impl ClientCore {
    pub fn new() -> ClientCore {
        ClientCore {
            pool: Mutex::new(ConnectionPool::new()),
            cookies: Mutex::new(CookieStore::new()),
        }
    }
}

/// A fully composed request, ready to execute.
pub(crate) struct RequestParts {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
    pub unix_socket: Option<String>,
    pub config: ClientConfig,
}

impl RequestParts {
    pub fn new(method: Method, url: impl Into<String>, config: ClientConfig) -> RequestParts {
        RequestParts {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            content_type: None,
            unix_socket: None,
            config,
        }
    }
}

/// Executes a request to completion, folding failures into the response.
pub(crate) async fn execute(core: &ClientCore, parts: RequestParts) -> ClientResponse {
    let url = parts.url.clone();
    let deadline = parts.config.timeout;
    match tokio::time::timeout(deadline, run(core, parts)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => ClientResponse::from_error(&e, url),
        Err(_) => ClientResponse::from_error(&Error::Timeout, url),
    }
}

async fn run(core: &ClientCore, parts: RequestParts) -> Result<ClientResponse> {
    let mut req = compose(&parts)?;
    let mut hops = 0usize;
    loop {
        let exchange = begin(core, &mut req, &parts.config).await?;
        let status = exchange.res.status().as_u16();

        if parts.config.follow_redirects
            && matches!(status, 301 | 302 | 303 | 307 | 308)
            && exchange.res.header("Location").is_some()
        {
            let location = exchange
                .res
                .header("Location")
                .map(str::to_string)
                .unwrap_or_default();
            // drain the redirect body so the socket can be reused
            let _ = finish_buffered(core, exchange).await?;
            hops += 1;
            if hops > parts.config.max_redirects {
                return Err(Error::TooManyRedirects(hops));
            }
            let old_host = req.host().to_string();
            apply_redirect(&mut req, &location, status)?;
            if req.host() != old_host {
                // never leak credentials across hosts
                req.headers_mut().remove("Authorization");
            }
            debug!(location = %location, hops, "following redirect");
            continue;
        }

        let mut res = finish_buffered(core, exchange).await?;
        if parts.config.auto_decompress {
            decode_response(&mut res)?;
        }
        return Ok(ClientResponse::from_response(res, req.url()));
    }
}

/// Executes a request and streams the final response body through
/// `on_chunk`; returning `false` from the callback aborts the transfer.
pub(crate) async fn execute_stream<F>(
    core: &ClientCore,
    parts: RequestParts,
    mut on_chunk: F,
) -> StreamResult
where
    F: FnMut(&StreamInfo<'_>) -> bool + Send,
{
    let deadline = parts.config.timeout;
    let fut = async {
        let mut req = compose(&parts)?;
        let mut hops = 0usize;
        let exchange = loop {
            let exchange = begin(core, &mut req, &parts.config).await?;
            let status = exchange.res.status().as_u16();
            if parts.config.follow_redirects
                && matches!(status, 301 | 302 | 303 | 307 | 308)
                && exchange.res.header("Location").is_some()
            {
                let location = exchange
                    .res
                    .header("Location")
                    .map(str::to_string)
                    .unwrap_or_default();
                let _ = finish_buffered(core, exchange).await?;
                hops += 1;
                if hops > parts.config.max_redirects {
                    return Err(Error::TooManyRedirects(hops));
                }
                let old_host = req.host().to_string();
                apply_redirect(&mut req, &location, status)?;
                if req.host() != old_host {
                    req.headers_mut().remove("Authorization");
                }
                continue;
            }
            break exchange;
        };
        finish_stream(exchange, &mut on_chunk).await
    };
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => StreamResult {
            error: e.to_string(),
            ..Default::default()
        },
        Err(_) => StreamResult {
            error: Error::Timeout.to_string(),
            ..Default::default()
        },
    }
}

/// Performs the WebSocket client handshake and returns the connection.
pub(crate) async fn websocket(config: &ClientConfig, url: &str) -> Result<WebSocket> {
    // accept ws/wss aliases for the http/https schemes
    let url = if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        url.to_string()
    };
    let mut req = Request::new();
    req.set_url(&url)?;
    let key = handshake::generate_key();
    handshake::apply_client_headers(&mut req, &key);
    req.headers_mut().set("User-Agent", &config.user_agent);

    let mut socket = connect(&req, config).await?;
    let head = codec::encode_request_head(&req)?;
    socket.write_all_buf(&head).await?;

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head = read_response_head(&mut socket, &mut buf).await?;
    let res = codec::response_from_head(head);
    handshake::verify_accept(&key, &res)?;
    trace!(url = %url, "websocket established");
    Ok(WebSocket::client(
        socket,
        buf,
        crate::ws::DEFAULT_MAX_MESSAGE_SIZE,
    ))
}

fn compose(parts: &RequestParts) -> Result<Request> {
    let mut req = Request::build(parts.method, &parts.url)?;
    *req.headers_mut() = parts.headers.clone();
    if let Some(path) = &parts.unix_socket {
        req.set_unix_socket(path.clone());
    }
    if let Some(body) = &parts.body {
        match (&parts.content_type, req.headers().contains("Content-Type")) {
            (Some(ctype), false) => req.set_content_with_type(body.clone(), ctype),
            _ => req.set_content(body.clone()),
        }
    }
    if !req.headers().contains("User-Agent") {
        req.headers_mut().set("User-Agent", &parts.config.user_agent);
    }
    if parts.config.auto_decompress && !req.headers().contains("Accept-Encoding") {
        req.headers_mut().set("Accept-Encoding", "gzip, deflate");
    }
    Ok(req)
}

/// A request sent and its response head parsed; the body is still on the
/// wire.
struct Exchange {
    socket: Socket,
    buf: BytesMut,
    res: Response,
    framing: BodyFraming,
    key: PoolKey,
    reusable: bool,
}

async fn connect(req: &Request, config: &ClientConfig) -> Result<Socket> {
    if let Some(path) = req.unix_socket() {
        #[cfg(unix)]
        return Socket::connect_unix(path, config.timeout).await;
        #[cfg(not(unix))]
        return Err(Error::Connect(format!(
            "unix sockets unsupported here: {path}"
        )));
    }
    if req.is_secure() {
        Socket::connect_tls(
            req.host(),
            req.port(),
            config.timeout,
            net::tls_client_config(config.verify_ssl),
        )
        .await
    } else {
        Socket::connect(req.host(), req.port(), config.timeout).await
    }
}

async fn read_response_head(
    socket: &mut Socket,
    buf: &mut BytesMut,
) -> Result<codec::ResponseHead> {
    loop {
        if let Some((head, consumed)) =
            codec::parse_response_head(buf, codec::DEFAULT_MAX_HEAD_BYTES)?
        {
            let _ = buf.split_to(consumed);
            // interim 1xx responses (100 Continue) are skipped; 101 is
            // meaningful and returned to the caller
            if head.status.is_informational()
                && head.status != crate::http::StatusCode::SwitchingProtocols
            {
                continue;
            }
            return Ok(head);
        }
        if buf.capacity() - buf.len() < 4 * 1024 {
            buf.reserve(codec::READ_CHUNK);
        }
        if socket.read_buf(buf).await? == 0 {
            return Err(Error::PeerClosed);
        }
    }
}

async fn begin(core: &ClientCore, req: &mut Request, config: &ClientConfig) -> Result<Exchange> {
    if let Some(cookie) = core
        .cookies
        .lock()
        .unwrap()
        .header_for(req.host(), req.path())
    {
        req.headers_mut().set("Cookie", cookie);
    } else {
        req.headers_mut().remove("Cookie");
    }

    let key = PoolKey {
        scheme: req.scheme(),
        host: req.host().to_string(),
        port: req.port(),
    };
    let pooled = core.pool.lock().unwrap().checkout(&key);
    let reused = pooled.is_some();
    let mut socket = match pooled {
        Some(socket) => socket,
        None => connect(req, config).await?,
    };
    trace!(socket = socket.id(), reused, method = %req.method(), uri = %req.uri(), "sending request");

    let head = codec::encode_request_head(req)?;
    let sent = async {
        socket.write_all_buf(&head).await?;
        if req.has_content() {
            socket.write_all_buf(req.body_bytes()).await?;
        }
        Ok::<_, Error>(())
    }
    .await;
    if let Err(e) = sent {
        // a stale pooled socket may have died; retry once on a fresh one
        if !reused {
            return Err(e);
        }
        socket = connect(req, config).await?;
        socket.write_all_buf(&head).await?;
        if req.has_content() {
            socket.write_all_buf(req.body_bytes()).await?;
        }
    }

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head = match read_response_head(&mut socket, &mut buf).await {
        Ok(head) => head,
        Err(Error::PeerClosed) if reused && buf.is_empty() => {
            // the pooled connection was closed under us before any bytes
            socket = connect(req, config).await?;
            socket.write_all_buf(&head).await?;
            if req.has_content() {
                socket.write_all_buf(req.body_bytes()).await?;
            }
            read_response_head(&mut socket, &mut buf).await?
        }
        Err(e) => return Err(e),
    };

    let http10 = head.version == 0;
    let mut res = codec::response_from_head(head);
    let status = res.status();
    let framing = codec::response_framing(
        res.headers_mut(),
        status,
        req.method() == Method::Head,
    )?;

    {
        let mut jar = core.cookies.lock().unwrap();
        for value in res.headers().get_all("Set-Cookie") {
            jar.store(req.host(), value);
        }
    }

    let reusable = !http10 && !res.wants_close() && framing != BodyFraming::UntilClose;
    Ok(Exchange {
        socket,
        buf,
        res,
        framing,
        key,
        reusable,
    })
}

/// Buffers the whole response body and returns the socket to the pool
/// when it stayed clean.
async fn finish_buffered(core: &ClientCore, mut ex: Exchange) -> Result<Response> {
    let mut body = BytesMut::new();
    match ex.framing {
        BodyFraming::None => {}
        BodyFraming::Length(n) => {
            if n > MAX_RESPONSE_BODY as u64 {
                return Err(Error::LimitExceeded("response body".into()));
            }
            let take = ex.buf.len().min(n as usize);
            body.extend_from_slice(&ex.buf.split_to(take));
            while (body.len() as u64) < n {
                if ex.socket.read_buf(&mut body).await? == 0 {
                    return Err(Error::PeerClosed);
                }
            }
            body.truncate(n as usize);
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkDecoder::new();
            loop {
                if decoder.decode(&mut ex.buf, &mut body)? {
                    break;
                }
                if body.len() > MAX_RESPONSE_BODY {
                    return Err(Error::LimitExceeded("response body".into()));
                }
                if ex.socket.read_buf(&mut ex.buf).await? == 0 {
                    return Err(Error::PeerClosed);
                }
            }
        }
        BodyFraming::UntilClose => {
            body.extend_from_slice(&ex.buf.split_to(ex.buf.len()));
            loop {
                if ex.socket.read_buf(&mut body).await? == 0 {
                    break;
                }
                if body.len() > MAX_RESPONSE_BODY {
                    return Err(Error::LimitExceeded("response body".into()));
                }
            }
        }
    }
    ex.res.set_body(Body::from(body.freeze()));
    if ex.reusable && ex.buf.is_empty() {
        core.pool.lock().unwrap().checkin(ex.key, ex.socket);
    }
    Ok(ex.res)
}

/// Streams the response body through `on_chunk`. The socket is never
/// pooled afterwards; aborting mid-body leaves it in an unknown state.
async fn finish_stream<F>(mut ex: Exchange, on_chunk: &mut F) -> Result<StreamResult>
where
    F: FnMut(&StreamInfo<'_>) -> bool + Send,
{
    let status = ex.res.status().as_u16();
    let total = match ex.framing {
        BodyFraming::Length(n) => n,
        _ => 0,
    };
    let mut result = StreamResult {
        status_code: status,
        ..Default::default()
    };

    let mut deliver = |result: &mut StreamResult, data: &[u8]| -> bool {
        if data.is_empty() {
            return true;
        }
        result.bytes_transferred += data.len() as u64;
        on_chunk(&StreamInfo {
            data,
            downloaded: result.bytes_transferred,
            total,
            status_code: status,
        })
    };

    match ex.framing {
        BodyFraming::None => {}
        BodyFraming::Length(n) => {
            let mut remaining = n;
            let take = ex.buf.len().min(remaining as usize);
            let first = ex.buf.split_to(take);
            remaining -= take as u64;
            if !deliver(&mut result, &first) {
                return Ok(result);
            }
            let mut chunk = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = chunk.len().min(remaining as usize);
                let n = ex.socket.read_some(&mut chunk[..want]).await?;
                if n == 0 {
                    return Err(Error::PeerClosed);
                }
                remaining -= n as u64;
                if !deliver(&mut result, &chunk[..n]) {
                    return Ok(result);
                }
            }
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkDecoder::new();
            let mut decoded = BytesMut::new();
            loop {
                let done = decoder.decode(&mut ex.buf, &mut decoded)?;
                if !decoded.is_empty() {
                    let chunk = decoded.split_to(decoded.len());
                    if !deliver(&mut result, &chunk) {
                        return Ok(result);
                    }
                }
                if done {
                    break;
                }
                if ex.socket.read_buf(&mut ex.buf).await? == 0 {
                    return Err(Error::PeerClosed);
                }
            }
        }
        BodyFraming::UntilClose => {
            let first = ex.buf.split_to(ex.buf.len());
            if !deliver(&mut result, &first) {
                return Ok(result);
            }
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                let n = ex.socket.read_some(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                if !deliver(&mut result, &chunk[..n]) {
                    return Ok(result);
                }
            }
        }
    }
    Ok(result)
}

/// Resolves `Location` against the current request and applies the
/// method/body rewrite rules for the status.
fn apply_redirect(req: &mut Request, location: &str, status: u16) -> Result<()> {
    if location.starts_with("http://") || location.starts_with("https://") {
        req.set_url(location)?;
    } else if let Some(rest) = location.strip_prefix("//") {
        let url = format!("{}://{}", req.scheme().as_str(), rest);
        req.set_url(&url)?;
    } else if location.starts_with('/') {
        req.set_uri(location);
    } else {
        let base = req.path().rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let target = format!("{base}/{location}");
        req.set_uri(&target);
    }

    // 303 always becomes a bodyless GET; mainstream clients also rewrite
    // non-GET 301/302
    let rewrite = status == 303
        || (matches!(status, 301 | 302)
            && !matches!(req.method(), Method::Get | Method::Head));
    if rewrite {
        req.set_method(Method::Get);
        req.take_body();
        req.headers_mut().remove("Content-Length");
        req.headers_mut().remove("Content-Type");
    }
    Ok(())
}

/// Undoes a supported `Content-Encoding` on a buffered response.
fn decode_response(res: &mut Response) -> Result<()> {
    let Some(coding) = res.header("Content-Encoding").map(str::to_string) else {
        return Ok(());
    };
    let Some(encoding) = Encoding::from_token(&coding) else {
        return Ok(());
    };
    let plain = compression::decompress(res.body_bytes(), encoding, MAX_RESPONSE_BODY)?;
    res.headers_mut().remove("Content-Encoding");
    res.headers_mut()
        .set("Content-Length", plain.len().to_string());
    res.set_body(Body::from(plain));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_req(url: &str) -> Request {
        let mut req = Request::build(Method::Get, url).unwrap();
        req.set_method(Method::Get);
        req
    }

    #[test]
    fn redirect_absolute_url() {
        let mut req = get_req("http://a.example/x");
        apply_redirect(&mut req, "https://b.example:8443/y?z=1", 302).unwrap();
        assert_eq!(req.host(), "b.example");
        assert_eq!(req.port(), 8443);
        assert!(req.is_secure());
        assert_eq!(req.uri(), "/y?z=1");
    }

    #[test]
    fn redirect_absolute_path() {
        let mut req = get_req("http://a.example/x/y");
        apply_redirect(&mut req, "/new", 301).unwrap();
        assert_eq!(req.host(), "a.example");
        assert_eq!(req.path(), "/new");
    }

    #[test]
    fn redirect_relative_path() {
        let mut req = get_req("http://a.example/docs/index.html");
        apply_redirect(&mut req, "other.html", 302).unwrap();
        assert_eq!(req.path(), "/docs/other.html");
    }

    #[test]
    fn redirect_scheme_relative() {
        let mut req = get_req("https://a.example/x");
        apply_redirect(&mut req, "//cdn.example/asset", 302).unwrap();
        assert_eq!(req.host(), "cdn.example");
        assert!(req.is_secure());
    }

    #[test]
    fn see_other_rewrites_to_get() {
        let mut req = Request::build(Method::Post, "http://a.example/submit").unwrap();
        req.set_content_with_type("payload", "text/plain");
        apply_redirect(&mut req, "/done", 303).unwrap();
        assert_eq!(req.method(), Method::Get);
        assert!(!req.has_content());
        assert!(!req.headers().contains("Content-Length"));
    }

    #[test]
    fn temporary_redirect_preserves_method() {
        let mut req = Request::build(Method::Post, "http://a.example/submit").unwrap();
        req.set_content_with_type("payload", "text/plain");
        apply_redirect(&mut req, "/retry", 307).unwrap();
        assert_eq!(req.method(), Method::Post);
        assert!(req.has_content());
    }

    #[test]
    fn compose_adds_defaults() {
        let parts = RequestParts::new(
            Method::Get,
            "http://example.com/x",
            ClientConfig::default(),
        );
        let req = compose(&parts).unwrap();
        assert!(req.headers().contains("User-Agent"));
        assert_eq!(req.header("Accept-Encoding"), Some("gzip, deflate"));
    }

    #[test]
    fn compose_respects_disabled_decompress() {
        let mut config = ClientConfig::default();
        config.auto_decompress = false;
        let parts = RequestParts::new(Method::Get, "http://example.com/x", config);
        let req = compose(&parts).unwrap();
        assert!(!req.headers().contains("Accept-Encoding"));
    }
}
