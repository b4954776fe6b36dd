//! Keep-alive connection reuse, keyed by `(scheme, host, port)`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::http::Scheme;
use crate::net::Socket;

/// Soft cap on idle sockets per key.
const MAX_IDLE_PER_KEY: usize = 8;

/// Idle sockets older than this are evicted instead of reused.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

struct Idle {
    socket: Socket,
    since: Instant,
}

/// Per-client pool of idle keep-alive connections.
#[derive(Default)]
pub(crate) struct ConnectionPool {
    idle: HashMap<PoolKey, Vec<Idle>>,
}

impl ConnectionPool {
    pub fn new() -> ConnectionPool {
        ConnectionPool::default()
    }

    /// Takes the freshest idle socket for `key`, discarding expired ones.
    pub fn checkout(&mut self, key: &PoolKey) -> Option<Socket> {
        let now = Instant::now();
        let idle = self.idle.get_mut(key)?;
        idle.retain(|entry| now.duration_since(entry.since) < IDLE_TIMEOUT);
        let socket = idle.pop().map(|entry| entry.socket);
        if idle.is_empty() {
            self.idle.remove(key);
        }
        socket
    }

    /// Returns a socket to the pool; over the cap the socket is dropped.
    pub fn checkin(&mut self, key: PoolKey, socket: Socket) {
        let idle = self.idle.entry(key).or_default();
        if idle.len() >= MAX_IDLE_PER_KEY {
            return;
        }
        idle.push(Idle {
            socket,
            since: Instant::now(),
        });
    }

    pub fn clear(&mut self) {
        self.idle.clear();
    }

    #[cfg(test)]
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.idle.get(key).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_socket() -> Socket {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Socket::from_tcp(client.unwrap())
    }

    fn key() -> PoolKey {
        PoolKey {
            scheme: Scheme::Http,
            host: "example.com".to_string(),
            port: 80,
        }
    }

    #[tokio::test]
    async fn checkout_returns_checked_in_socket() {
        let mut pool = ConnectionPool::new();
        assert!(pool.checkout(&key()).is_none());

        pool.checkin(key(), make_socket().await);
        assert_eq!(pool.idle_count(&key()), 1);
        assert!(pool.checkout(&key()).is_some());
        assert!(pool.checkout(&key()).is_none());
    }

    #[tokio::test]
    async fn per_key_cap_applies() {
        let mut pool = ConnectionPool::new();
        for _ in 0..MAX_IDLE_PER_KEY + 3 {
            pool.checkin(key(), make_socket().await);
        }
        assert_eq!(pool.idle_count(&key()), MAX_IDLE_PER_KEY);
    }

    #[tokio::test]
    async fn keys_are_disjoint() {
        let mut pool = ConnectionPool::new();
        pool.checkin(key(), make_socket().await);
        let other = PoolKey {
            port: 8080,
            ..key()
        };
        assert!(pool.checkout(&other).is_none());
        assert!(pool.checkout(&key()).is_some());
    }
}
