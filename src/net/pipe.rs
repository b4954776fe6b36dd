//! Bidirectional socket forwarding, used by CONNECT/intercept paths and
//! for plain proxying.

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Socket;
use crate::{Error, Result};

type EndCallback = Box<dyn FnOnce(u64, u64) + Send>;

/// Forwards bytes between two sockets in both directions until either
/// direction reaches EOF or fails, then closes both sides.
///
/// Byte counters are kept per direction. The `on_end` callback fires
/// exactly once, when the pipe value is destroyed (not merely when the
/// copy tasks finish), so observers see final totals.
pub struct SocketPipe {
    source: Option<Socket>,
    target: Option<Socket>,
    cancel: CancellationToken,
    bytes_source_to_target: u64,
    bytes_target_to_source: u64,
    on_end: Option<EndCallback>,
}

impl SocketPipe {
    pub fn new(source: Socket, target: Socket) -> Self {
        SocketPipe {
            source: Some(source),
            target: Some(target),
            cancel: CancellationToken::new(),
            bytes_source_to_target: 0,
            bytes_target_to_source: 0,
            on_end: None,
        }
    }

    /// Registers the end-of-life callback, receiving the two byte counters.
    pub fn set_on_end(&mut self, f: impl FnOnce(u64, u64) + Send + 'static) {
        self.on_end = Some(Box::new(f));
    }

    /// A handle that aborts both directions promptly.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Aborts both copy directions.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Application bytes copied from source to target so far.
    pub fn bytes_source_to_target(&self) -> u64 {
        self.bytes_source_to_target
    }

    /// Application bytes copied from target to source so far.
    pub fn bytes_target_to_source(&self) -> u64 {
        self.bytes_target_to_source
    }

    /// Runs both copy directions to completion. Resolves once both have
    /// terminated and both sockets are shut down.
    pub async fn run(&mut self) -> Result<()> {
        let source = self.source.take().ok_or(Error::Cancelled)?;
        let target = self.target.take().ok_or(Error::Cancelled)?;
        let source_id = source.id().to_string();
        let target_id = target.id().to_string();

        let (source_rd, source_wr) = tokio::io::split(source);
        let (target_rd, target_wr) = tokio::io::split(target);

        let cancel = self.cancel.clone();
        let (forward, backward) = tokio::join!(
            async {
                let n = copy_direction(source_rd, target_wr, &cancel).await;
                // stop the opposite direction once this one is done
                cancel.cancel();
                n
            },
            async {
                let n = copy_direction(target_rd, source_wr, &cancel).await;
                cancel.cancel();
                n
            },
        );
        self.bytes_source_to_target = forward;
        self.bytes_target_to_source = backward;
        debug!(
            source = %source_id,
            target = %target_id,
            forward,
            backward,
            "socket pipe finished"
        );
        Ok(())
    }
}

impl Drop for SocketPipe {
    fn drop(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end(self.bytes_source_to_target, self.bytes_target_to_source);
        }
    }
}

async fn copy_direction(
    mut rd: ReadHalf<Socket>,
    mut wr: WriteHalf<Socket>,
    cancel: &CancellationToken,
) -> u64 {
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = rd.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if wr.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = wr.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (Socket, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (connected, accepted) = tokio::join!(client, listener.accept());
        (
            Socket::from_tcp(connected.unwrap()),
            Socket::from_tcp(accepted.unwrap().0),
        )
    }

    #[tokio::test]
    async fn forwards_and_counts_both_directions() {
        // client <-> (proxy_in | proxy_out) <-> backend echo
        let (client_side, proxy_in) = socket_pair().await;
        let (proxy_out, backend_side) = socket_pair().await;

        // Backend: echo until EOF.
        let backend = tokio::spawn(async move {
            let mut sock = backend_side;
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read_some(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                if sock.write_all_buf(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let mut pipe = SocketPipe::new(proxy_in, proxy_out);
        pipe.set_on_end(move |fwd, bwd| {
            assert_eq!(fwd, 11);
            assert_eq!(bwd, 11);
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        let pipe_task = tokio::spawn(async move {
            pipe.run().await.unwrap();
            pipe
        });

        let mut client = client_side;
        client.write_all_buf(b"Hello, pipe").await.unwrap();
        let mut buf = [0u8; 32];
        let mut got = 0;
        while got < 11 {
            let n = client.read_some(&mut buf[got..]).await.unwrap();
            assert!(n > 0);
            got += n;
        }
        assert_eq!(&buf[..11], b"Hello, pipe");
        client.close().await.unwrap();
        drop(client);

        let pipe = pipe_task.await.unwrap();
        assert_eq!(pipe.bytes_source_to_target(), 11);
        assert_eq!(pipe.bytes_target_to_source(), 11);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "on_end before destruction");
        drop(pipe);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_aborts_promptly() {
        let (_client_side, proxy_in) = socket_pair().await;
        let (proxy_out, _backend_side) = socket_pair().await;

        let mut pipe = SocketPipe::new(proxy_in, proxy_out);
        let handle = pipe.cancel_handle();
        let run = tokio::spawn(async move {
            pipe.run().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("pipe did not stop after cancel")
            .unwrap();
    }
}
