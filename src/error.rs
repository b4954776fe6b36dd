use std::{error::Error as StdError, fmt, io};

/// Alias for a `Result` with the crate error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the server, the client and the protocol codecs.
///
/// Transport-level failures on the client side are folded into
/// [`ClientResponse::error`](crate::client::ClientResponse::error); the server
/// maps these to status codes before a connection is closed.
#[derive(Debug)]
pub enum Error {
    /// The listener could not acquire its host/port.
    Bind(String),
    /// Malformed HTTP or WebSocket input.
    Parse(String),
    /// A configured limit was exceeded (body, header or frame size).
    LimitExceeded(String),
    /// A deadline elapsed.
    Timeout,
    /// DNS, TCP or Unix socket connect failure.
    Connect(String),
    /// TLS handshake or verification failure.
    Tls(String),
    /// Credentials missing or rejected.
    Auth,
    /// Uncaught failure in user handler code.
    Handler(String),
    /// The remote closed the connection.
    PeerClosed,
    /// The operation was cancelled through its cancel token.
    Cancelled,
    /// A URL could not be parsed.
    InvalidUrl(String),
    /// The redirect chain exceeded the configured maximum.
    TooManyRedirects(usize),
    /// The WebSocket connection was closed with the given code.
    WebSocketClosed { code: u16, reason: String },
    /// Any other I/O failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bind(msg) => write!(f, "failed to bind listener: {msg}"),
            Error::Parse(msg) => write!(f, "malformed message: {msg}"),
            Error::LimitExceeded(what) => write!(f, "limit exceeded: {what}"),
            Error::Timeout => f.write_str("timeout"),
            Error::Connect(msg) => write!(f, "connect failed: {msg}"),
            Error::Tls(msg) => write!(f, "tls failure: {msg}"),
            Error::Auth => f.write_str("authentication failed"),
            Error::Handler(msg) => write!(f, "handler failed: {msg}"),
            Error::PeerClosed => f.write_str("connection closed by peer"),
            Error::Cancelled => f.write_str("operation cancelled"),
            Error::InvalidUrl(url) => write!(f, "invalid url: {url}"),
            Error::TooManyRedirects(n) => write!(f, "too many redirects ({n})"),
            Error::WebSocketClosed { code, reason } => {
                if reason.is_empty() {
                    write!(f, "websocket closed with code {code}")
                } else {
                    write!(f, "websocket closed with code {code}: {reason}")
                }
            }
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Error::PeerClosed,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl Error {
    /// True when the error denotes an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True when the peer went away mid-exchange.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Error::PeerClosed)
    }
}
