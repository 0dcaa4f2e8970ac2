//! Pooled back-end connections, keyed by hostname. A connection
//! checked back in after use sits idle until either reused or reaped;
//! [`BackendPool::reap_idle`] is meant to be driven by a periodic
//! background task (the `silo` binary's proxy daemon ticks it every
//! few seconds) rather than on every checkout, so a burst of traffic
//! doesn't pay the reaping cost per request.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

/// A connection to a back-end mailbox server, authenticated once as
/// the proxy's admin identity. Higher layers pass per-user commands
/// over it using SASL proxy authorization, not a fresh login each
/// time.
pub struct BackendConn {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl BackendConn {
    async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(BackendConn {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await
    }

    /// Writes raw bytes with no added framing, for a literal's body.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await
    }

    pub async fn read_line(&mut self) -> io::Result<String> {
        let mut buf = String::new();
        self.reader.read_line(&mut buf).await?;
        Ok(buf)
    }
}

struct Idle {
    conn: BackendConn,
    since: Instant,
}

pub struct BackendPool {
    idle: Mutex<HashMap<String, Vec<Idle>>>,
    idle_timeout: Duration,
}

impl BackendPool {
    pub fn new(idle_timeout: Duration) -> Self {
        BackendPool {
            idle: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Takes an idle connection to `host` if one is sitting in the
    /// pool, otherwise dials a fresh one.
    pub async fn checkout(&self, host: &str) -> io::Result<BackendConn> {
        {
            let mut idle = self.idle.lock().await;
            if let Some(conns) = idle.get_mut(host) {
                if let Some(entry) = conns.pop() {
                    return Ok(entry.conn);
                }
            }
        }
        BackendConn::connect(host).await
    }

    /// Returns a connection to the pool for reuse.
    pub async fn checkin(&self, host: &str, conn: BackendConn) {
        let mut idle = self.idle.lock().await;
        idle.entry(host.to_string()).or_default().push(Idle {
            conn,
            since: Instant::now(),
        });
    }

    /// Drops every idle connection that has sat unused longer than
    /// the pool's idle timeout. Returns the number reaped.
    pub async fn reap_idle(&self) -> usize {
        let mut idle = self.idle.lock().await;
        let mut reaped = 0;
        for conns in idle.values_mut() {
            let before = conns.len();
            conns.retain(|entry| entry.since.elapsed() < self.idle_timeout);
            reaped += before - conns.len();
        }
        idle.retain(|_, conns| !conns.is_empty());
        reaped
    }

    pub async fn idle_count(&self, host: &str) -> usize {
        self.idle.lock().await.get(host).map(Vec::len).unwrap_or(0)
    }
}
