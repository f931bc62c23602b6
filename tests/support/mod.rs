#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use fetchstore::{
    store::{ObjectStore, SharedStore},
    transfer::{Connection, Engine, EngineConfig, FetchState, RequestProfile},
};

/// One scripted answer, consumed by whichever connection reads the next
/// request.
#[derive(Debug, Clone)]
pub struct Reply {
    bytes: Vec<u8>,
    close: bool,
    stall: bool,
}

impl Reply {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            close: false,
            stall: false,
        }
    }

    /// `200 OK` with a `Content-Length` body and extra header lines.
    pub fn ok(body: impl AsRef<[u8]>, headers: &[&str]) -> Self {
        Self::status("200 OK", body, headers)
    }

    pub fn status(status: &str, body: impl AsRef<[u8]>, headers: &[&str]) -> Self {
        let body = body.as_ref();
        let mut bytes = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\n", body.len());
        for header in headers {
            bytes.push_str(header);
            bytes.push_str("\r\n");
        }
        bytes.push_str("\r\n");
        let mut bytes = bytes.into_bytes();
        bytes.extend_from_slice(body);
        Self::raw(bytes)
    }

    /// Server closes the socket right after writing.
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Server writes, then keeps the socket open without sending more.
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }
}

/// A local HTTP/1.1 upstream that answers requests from a script.
pub struct TestUpstream {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn start(replies: Vec<Reply>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let accepts = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(replies)));

        let handle = {
            let accepts = accepts.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepts.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, script.clone(), requests.clone()));
                }
            })
        };

        Ok(Self {
            addr,
            accepts,
            requests,
            handle,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far.
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Every request received so far, head and body as text.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    script: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let mut pending = Vec::new();
    loop {
        let Some(request) = read_request(&mut socket, &mut pending).await else {
            return;
        };
        requests.lock().push(request);
        let Some(reply) = script.lock().pop_front() else {
            return;
        };
        if socket.write_all(&reply.bytes).await.is_err() {
            return;
        }
        if reply.stall {
            let mut sink = [0u8; 1024];
            while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
            return;
        }
        if reply.close {
            let _ = socket.shutdown().await;
            return;
        }
    }
}

async fn read_request(socket: &mut TcpStream, pending: &mut Vec<u8>) -> Option<String> {
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        pending.extend_from_slice(&buf[..n]);
    };
    let head = String::from_utf8_lossy(&pending[..head_end]).into_owned();
    let body_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while pending.len() < head_end + body_len {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        pending.extend_from_slice(&buf[..n]);
    }
    let request: Vec<u8> = pending.drain(..head_end + body_len).collect();
    Some(String::from_utf8_lossy(&request).into_owned())
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        request: RequestProfile::default(),
        connect_timeout: StdDuration::from_secs(2),
        io_timeout: StdDuration::from_secs(5),
        max_tries: 3,
        max_header_size: 32 * 1024,
        keepalive_capacity: NonZeroUsize::new(8).expect("non-zero"),
        keepalive_timeout: StdDuration::from_secs(60),
    }
}

pub fn test_engine(quota: u64) -> Engine {
    Engine::new(test_config(), SharedStore::new(ObjectStore::new(quota, 75)))
}

/// Contiguous cached bytes for `key`, as a string.
pub fn cached_text(engine: &Engine, key: &str) -> String {
    let (bytes, _) = engine.read_available(key).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Polls a handle until `accept` matches its state.
pub async fn wait_for_state(
    conn: &Connection,
    accept: impl Fn(&FetchState) -> bool,
) -> Result<FetchState> {
    let deadline = Instant::now() + StdDuration::from_secs(5);
    loop {
        let state = conn.state();
        if accept(&state) {
            return Ok(state);
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("state never reached; last was {state:?}"));
        }
        sleep(StdDuration::from_millis(10)).await;
    }
}
