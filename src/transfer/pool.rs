use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::debug;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PoolKey {
    host: String,
    port: u16,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[derive(Debug)]
pub struct IdleConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    idle_since: Instant,
}

/// Keep-alive sockets waiting for the next request to the same host.
#[derive(Debug)]
pub struct IdlePool {
    entries: LruCache<PoolKey, IdleConnection>,
    idle_timeout: Duration,
}

impl IdlePool {
    pub fn new(capacity: NonZeroUsize, idle_timeout: Duration) -> Self {
        crate::metrics::set_pool_capacity(capacity.get());
        let pool = Self {
            entries: LruCache::new(capacity),
            idle_timeout,
        };
        crate::metrics::set_pool_size(pool.entries.len());
        pool
    }

    /// Hands out the idle socket for `key` unless it sat around too long.
    pub fn take(&mut self, key: &PoolKey) -> Option<IdleConnection> {
        let conn = self.entries.pop(key);
        crate::metrics::set_pool_size(self.entries.len());
        let conn = conn?;
        if conn.idle_since.elapsed() >= self.idle_timeout {
            debug!(
                host = %key.host,
                port = key.port,
                "dropping expired idle connection"
            );
            return None;
        }
        Some(conn)
    }

    pub fn put(&mut self, key: PoolKey, stream: TcpStream, peer: SocketAddr) {
        let conn = IdleConnection {
            stream,
            peer,
            idle_since: Instant::now(),
        };
        if let Some((evicted, _conn)) = self.entries.push(key, conn) {
            debug!(
                host = %evicted.host,
                port = evicted.port,
                "closing idle connection displaced from pool"
            );
        }
        crate::metrics::set_pool_size(self.entries.len());
    }

    /// Closes every socket whose idle time ran out.
    pub fn prune(&mut self) -> usize {
        let expired: Vec<PoolKey> = self
            .entries
            .iter()
            .filter(|(_, conn)| conn.idle_since.elapsed() >= self.idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        crate::metrics::set_pool_size(self.entries.len());
        expired.len()
    }

    pub fn drain(&mut self) -> Vec<IdleConnection> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some((_key, conn)) = self.entries.pop_lru() {
            drained.push(conn);
        }
        crate::metrics::set_pool_size(0);
        drained
    }
}

pub async fn shutdown_all(conns: Vec<IdleConnection>, shutdown_timeout: Duration) {
    for mut conn in conns {
        match timeout(shutdown_timeout, conn.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(
                peer = %conn.peer,
                error = %err,
                "failed to shut down idle connection"
            ),
            Err(_) => debug!(peer = %conn.peer, "timed out shutting down idle connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tokio::net::TcpListener;

    async fn socket_pair() -> Result<(TcpStream, TcpStream, SocketAddr)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        Ok((client, server, addr))
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    #[tokio::test]
    async fn reuses_socket_for_same_host_only() -> Result<()> {
        let (client, _server, addr) = socket_pair().await?;
        let mut pool = IdlePool::new(capacity(4), Duration::from_secs(60));
        pool.put(PoolKey::new("example.com", 80), client, addr);

        assert!(pool.take(&PoolKey::new("example.com", 8080)).is_none());
        assert!(pool.take(&PoolKey::new("other.test", 80)).is_none());
        let conn = pool
            .take(&PoolKey::new("example.com", 80))
            .expect("pooled socket");
        assert_eq!(conn.peer, addr);
        assert!(pool.entries.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn expired_sockets_are_not_handed_out() -> Result<()> {
        let (client, _server, addr) = socket_pair().await?;
        let mut pool = IdlePool::new(capacity(4), Duration::ZERO);
        pool.put(PoolKey::new("example.com", 80), client, addr);
        assert!(pool.take(&PoolKey::new("example.com", 80)).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn capacity_displaces_least_recent() -> Result<()> {
        let (a, _sa, addr_a) = socket_pair().await?;
        let (b, _sb, addr_b) = socket_pair().await?;
        let mut pool = IdlePool::new(capacity(1), Duration::from_secs(60));
        pool.put(PoolKey::new("a.test", 80), a, addr_a);
        pool.put(PoolKey::new("b.test", 80), b, addr_b);
        assert_eq!(pool.entries.len(), 1);
        assert!(pool.take(&PoolKey::new("a.test", 80)).is_none());
        assert!(pool.take(&PoolKey::new("b.test", 80)).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn prune_and_drain_empty_the_pool() -> Result<()> {
        let (a, _sa, addr_a) = socket_pair().await?;
        let mut pool = IdlePool::new(capacity(2), Duration::ZERO);
        pool.put(PoolKey::new("a.test", 80), a, addr_a);
        assert_eq!(pool.prune(), 1);

        let (b, _sb, addr_b) = socket_pair().await?;
        let mut pool = IdlePool::new(capacity(2), Duration::from_secs(60));
        pool.put(PoolKey::new("b.test", 80), b, addr_b);
        let drained = pool.drain();
        assert_eq!(drained.len(), 1);
        shutdown_all(drained, Duration::from_millis(100)).await;
        assert!(pool.entries.is_empty());
        Ok(())
    }
}
