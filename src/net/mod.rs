//! Transport abstraction: one [`Socket`] type over plain TCP, TLS and
//! Unix-domain streams, plus the bidirectional [`SocketPipe`] forwarder.

mod pipe;

pub use pipe::SocketPipe;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::{Error, Result};

/// Marker for byte streams the protocol layers run over. Implemented by
/// [`Socket`] and by in-memory streams in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A connected byte stream: plain TCP, TLS over TCP, or a Unix-domain
/// socket. Carries a diagnostics identifier used in log output.
pub struct Socket {
    id: String,
    inner: Inner,
}

enum Inner {
    Tcp(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            Inner::Tcp(_) => "tcp",
            Inner::TlsClient(_) | Inner::TlsServer(_) => "tls",
            #[cfg(unix)]
            Inner::Unix(_) => "unix",
        };
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

async fn within<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout),
    }
}

impl Socket {
    /// Opens a plain TCP connection, bounded by `deadline`.
    pub async fn connect(host: &str, port: u16, deadline: Duration) -> Result<Socket> {
        within(deadline, async {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Connect(format!("{host}:{port}: {e}")))?;
            let _ = stream.set_nodelay(true);
            Ok(Socket {
                id: format!("tcp:{host}:{port}"),
                inner: Inner::Tcp(stream),
            })
        })
        .await
    }

    /// Opens a TLS connection, performing the handshake before returning.
    pub async fn connect_tls(
        host: &str,
        port: u16,
        deadline: Duration,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<Socket> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Tls(format!("invalid server name {host:?}")))?;
        within(deadline, async {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Connect(format!("{host}:{port}: {e}")))?;
            let _ = stream.set_nodelay(true);
            let tls = TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;
            Ok(Socket {
                id: format!("tls:{host}:{port}"),
                inner: Inner::TlsClient(Box::new(tls)),
            })
        })
        .await
    }

    /// Opens a Unix-domain connection.
    #[cfg(unix)]
    pub async fn connect_unix(path: &str, deadline: Duration) -> Result<Socket> {
        within(deadline, async {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| Error::Connect(format!("{path}: {e}")))?;
            Ok(Socket {
                id: format!("unix:{path}"),
                inner: Inner::Unix(stream),
            })
        })
        .await
    }

    /// Wraps an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Socket {
        let id = stream
            .peer_addr()
            .map(|a| format!("tcp:{a}"))
            .unwrap_or_else(|_| "tcp:?".to_string());
        let _ = stream.set_nodelay(true);
        Socket {
            id,
            inner: Inner::Tcp(stream),
        }
    }

    /// Performs the server-side TLS handshake on an accepted TCP stream.
    pub async fn accept_tls(
        stream: TcpStream,
        acceptor: tokio_rustls::TlsAcceptor,
    ) -> Result<Socket> {
        let id = stream
            .peer_addr()
            .map(|a| format!("tls:{a}"))
            .unwrap_or_else(|_| "tls:?".to_string());
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Socket {
            id,
            inner: Inner::TlsServer(Box::new(tls)),
        })
    }

    /// Wraps an accepted Unix-domain stream.
    #[cfg(unix)]
    pub fn from_unix(stream: UnixStream) -> Socket {
        Socket {
            id: "unix:peer".to_string(),
            inner: Inner::Unix(stream),
        }
    }

    /// Diagnostics identifier (`tcp:1.2.3.4:80`, `tls:...`, `unix:...`).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this transport ran a TLS handshake.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner, Inner::TlsClient(_) | Inner::TlsServer(_))
    }

    /// Reads some bytes, returning `0` at EOF.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.read(buf).await?)
    }

    /// Writes the whole buffer.
    pub async fn write_all_buf(&mut self, buf: &[u8]) -> Result<()> {
        AsyncWriteExt::write_all(self, buf).await?;
        Ok(())
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&mut self) -> Result<()> {
        self.shutdown().await?;
        Ok(())
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $e:expr) => {
        match &mut $self.get_mut().inner {
            Inner::Tcp($inner) => $e,
            Inner::TlsClient($inner) => $e,
            Inner::TlsServer($inner) => $e,
            #[cfg(unix)]
            Inner::Unix($inner) => $e,
        }
    };
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        match &self.inner {
            Inner::Tcp(s) => s.is_write_vectored(),
            Inner::TlsClient(s) => s.is_write_vectored(),
            Inner::TlsServer(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Inner::Unix(s) => s.is_write_vectored(),
        }
    }
}

/// Builds the client-side TLS configuration. With `verify` the Mozilla
/// root store backs certificate validation; without it every certificate
/// is accepted (test servers, self-signed deployments).
pub fn tls_client_config(verify: bool) -> Arc<rustls::ClientConfig> {
    if verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    } else {
        Arc::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new()))
                .with_no_client_auth(),
        )
    }
}

mod danger {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Signature checks still run so the
    /// handshake itself stays well-formed.
    #[derive(Debug)]
    pub(super) struct NoCertificateVerification {
        provider: tokio_rustls::rustls::crypto::CryptoProvider,
    }

    impl NoCertificateVerification {
        pub(super) fn new() -> Self {
            NoCertificateVerification {
                provider: ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut sock = Socket::connect("127.0.0.1", addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(sock.id().starts_with("tcp:"));
        assert!(!sock.is_tls());
        sock.write_all_buf(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let n = sock.read_some(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        // Bind then drop to get a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = Socket::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }
}
