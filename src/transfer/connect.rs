use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Tries each address in turn and returns the first connection that opens.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(
                    anyhow::Error::new(err).context(format!("failed to connect to {addr}")),
                );
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses to connect to")))
}
