//! Framed connections to workers.
//!
//! Control traffic is newline-terminated ASCII lines; binary payloads
//! follow a header line announcing their exact byte count. Every read and
//! write carries a deadline. Bulk transfers derive their deadline from the
//! expected size and an observed bandwidth estimate; short control
//! exchanges use the configured short timeout.
//!
//! The transport is either plain TCP or TLS wrapped immediately after
//! accept, before the first message.
use crate::error::{SwarmError, SwarmResult};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;

/// Longest accepted control line, matching the worker's own limit.
pub const LINE_MAX: usize = 4096;

/// Plain or TLS-wrapped worker connection.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    fn tcp_ref(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One worker connection with its receive buffer.
pub struct Connection {
    transport: Transport,
    peer: SocketAddr,
    inbuf: Vec<u8>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        Connection {
            transport: Transport::Plain(stream),
            peer,
            inbuf: Vec::new(),
        }
    }

    /// Wrap the freshly accepted stream in TLS. Must happen before any
    /// other traffic.
    pub async fn wrap_tls(
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: &tokio_rustls::TlsAcceptor,
        deadline: Instant,
    ) -> SwarmResult<Self> {
        let _ = stream.set_nodelay(true);
        let tls = tokio::time::timeout_at(deadline, acceptor.accept(stream))
            .await
            .map_err(|_| SwarmError::timeout(format!("TLS handshake with {}", peer)))?
            .map_err(|e| SwarmError::tls(format!("handshake with {}: {}", peer, e)))?;
        Ok(Connection {
            transport: Transport::Tls(Box::new(tls)),
            peer,
            inbuf: Vec::new(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn peer_addrport(&self) -> String {
        format!("{}:{}", self.peer.ip(), self.peer.port())
    }

    /// True when bytes already sit in the receive buffer.
    pub fn has_buffered(&self) -> bool {
        !self.inbuf.is_empty()
    }

    /// Wait until the connection may have data to read. Returns
    /// immediately when the receive buffer is non-empty.
    pub async fn readiness(&self) {
        if self.has_buffered() {
            return;
        }
        // A spurious wakeup only costs one short-timeout read attempt.
        let _ = self.transport.tcp_ref().readable().await;
    }

    async fn fill(&mut self, deadline: Instant) -> SwarmResult<usize> {
        let mut chunk = [0u8; 8192];
        let n = tokio::time::timeout_at(deadline, self.transport.read(&mut chunk))
            .await
            .map_err(|_| SwarmError::timeout(format!("read from {}", self.peer)))??;
        if n == 0 {
            return Err(SwarmError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            )));
        }
        self.inbuf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read one newline-terminated line, stripping the terminator (and a
    /// preceding carriage return, for the HTTP surface).
    pub async fn read_line(&mut self, deadline: Instant) -> SwarmResult<String> {
        loop {
            if let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.inbuf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line).map_err(|_| {
                    SwarmError::protocol(self.peer_addrport(), "non-UTF8 control line")
                });
            }
            if self.inbuf.len() > LINE_MAX {
                return Err(SwarmError::protocol(
                    self.peer_addrport(),
                    "control line exceeds maximum length",
                ));
            }
            self.fill(deadline).await?;
        }
    }

    /// Read exactly `n` payload bytes.
    pub async fn read_exact(&mut self, n: usize, deadline: Instant) -> SwarmResult<Vec<u8>> {
        while self.inbuf.len() < n {
            self.fill(deadline).await?;
        }
        Ok(self.inbuf.drain(..n).collect())
    }

    /// Stream `length` payload bytes into a writer, returning the byte
    /// count actually moved.
    pub async fn stream_to<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut W,
        length: i64,
        deadline: Instant,
    ) -> SwarmResult<i64> {
        let mut remaining = length;
        while remaining > 0 {
            if self.inbuf.is_empty() {
                self.fill(deadline).await?;
            }
            let take = (self.inbuf.len() as i64).min(remaining) as usize;
            let chunk: Vec<u8> = self.inbuf.drain(..take).collect();
            out.write_all(&chunk).await?;
            remaining -= take as i64;
        }
        Ok(length - remaining)
    }

    /// Read and discard `length` payload bytes, e.g. a stale result body.
    pub async fn drain(&mut self, length: i64, deadline: Instant) -> SwarmResult<()> {
        let mut remaining = length;
        while remaining > 0 {
            if self.inbuf.is_empty() {
                self.fill(deadline).await?;
            }
            let take = (self.inbuf.len() as i64).min(remaining) as usize;
            self.inbuf.drain(..take);
            remaining -= take as i64;
        }
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8], deadline: Instant) -> SwarmResult<()> {
        tokio::time::timeout_at(deadline, async {
            self.transport.write_all(data).await?;
            self.transport.flush().await
        })
        .await
        .map_err(|_| SwarmError::timeout(format!("write to {}", self.peer)))??;
        Ok(())
    }

    /// Send one control line. The caller includes the trailing newline.
    pub async fn send(&mut self, line: &str, deadline: Instant) -> SwarmResult<()> {
        self.write_all(line.as_bytes(), deadline).await
    }

    /// Stream `length` bytes from a reader to the connection, returning
    /// the byte count actually moved.
    pub async fn stream_from<R: AsyncRead + Unpin>(
        &mut self,
        src: &mut R,
        length: i64,
        deadline: Instant,
    ) -> SwarmResult<i64> {
        let mut remaining = length;
        let mut chunk = vec![0u8; 65536];
        while remaining > 0 {
            let want = (chunk.len() as i64).min(remaining) as usize;
            let n = tokio::time::timeout_at(deadline, src.read(&mut chunk[..want]))
                .await
                .map_err(|_| SwarmError::timeout(format!("transfer to {}", self.peer)))??;
            if n == 0 {
                break;
            }
            self.write_all(&chunk[..n], deadline).await?;
            remaining -= n as i64;
        }
        Ok(length - remaining)
    }

    /// Challenge the worker to prove knowledge of the shared password
    /// without sending it in the clear.
    pub async fn authenticate(&mut self, password: &str, deadline: Instant) -> SwarmResult<bool> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        self.send(&format!("challenge {}\n", nonce), deadline).await?;
        let reply = self.read_line(deadline).await?;
        let expected = format!("{:x}", md5::compute(format!("{}{}", password, nonce)));
        let ok = reply == expected;
        self.send(if ok { "yes\n" } else { "no\n" }, deadline).await?;
        Ok(ok)
    }
}

/// Bandwidth context used to size bulk-transfer deadlines.
///
/// Preference order: the worker's own observed rate, the manager-wide
/// rate, then a conservative configured default. The resulting window
/// tolerates transfers up to `outlier_factor` times slower than the
/// estimate, and never shrinks below `minimum_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct TransferRate {
    /// Worker's observed bytes/sec, when it has history.
    pub worker_rate: Option<f64>,
    /// Manager-wide observed bytes/sec, when there is history.
    pub queue_rate: Option<f64>,
    /// Conservative fallback, bytes/sec.
    pub default_rate: f64,
    pub outlier_factor: f64,
    pub minimum_timeout: Duration,
}

impl TransferRate {
    pub fn effective_rate(&self) -> f64 {
        self.worker_rate
            .or(self.queue_rate)
            .unwrap_or(self.default_rate)
    }

    /// Deadline window for transferring `length` bytes.
    pub fn wait_time(&self, length: i64) -> Duration {
        let tolerable = self.effective_rate() / self.outlier_factor;
        let secs = if tolerable > 0.0 {
            length.max(0) as f64 / tolerable
        } else {
            0.0
        };
        Duration::from_secs_f64(secs).max(self.minimum_timeout)
    }

    pub fn deadline_for(&self, length: i64) -> Instant {
        Instant::now() + self.wait_time(length)
    }
}

/// Load a TLS acceptor from PEM key and certificate files.
pub fn tls_acceptor(key_path: &str, cert_path: &str) -> SwarmResult<tokio_rustls::TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        cert_path,
    )?))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| SwarmError::tls(format!("reading {}: {}", cert_path, e)))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        key_path,
    )?))
    .map_err(|e| SwarmError::tls(format!("reading {}: {}", key_path, e)))?
    .ok_or_else(|| SwarmError::tls(format!("no private key in {}", key_path)))?;
    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SwarmError::tls(e.to_string()))?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
pub(crate) async fn test_pair() -> (Connection, TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    (Connection::new(server, peer), client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_read_line_strips_terminators() {
        let (mut conn, mut client) = test_pair().await;
        client.write_all(b"hello world\r\nsecond\n").await.unwrap();
        assert_eq!(conn.read_line(soon()).await.unwrap(), "hello world");
        assert_eq!(conn.read_line(soon()).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_payload_after_header_line() {
        let (mut conn, mut client) = test_pair().await;
        client.write_all(b"put name 5 0755\nABCDE").await.unwrap();
        assert_eq!(conn.read_line(soon()).await.unwrap(), "put name 5 0755");
        assert_eq!(conn.read_exact(5, soon()).await.unwrap(), b"ABCDE");
    }

    #[tokio::test]
    async fn test_read_line_deadline_expires() {
        let (mut conn, _client) = test_pair().await;
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = conn.read_line(deadline).await.unwrap_err();
        assert!(matches!(err, SwarmError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_drain_discards_exact_count() {
        let (mut conn, mut client) = test_pair().await;
        client.write_all(b"0123456789tail\n").await.unwrap();
        conn.drain(10, soon()).await.unwrap();
        assert_eq!(conn.read_line(soon()).await.unwrap(), "tail");
    }

    #[tokio::test]
    async fn test_authenticate_accepts_correct_digest() {
        let (mut conn, mut client) = test_pair().await;
        let manager = tokio::spawn(async move {
            let ok = conn.authenticate("sekrit", soon()).await.unwrap();
            (conn, ok)
        });

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]).to_string();
        let nonce = line.trim_end().strip_prefix("challenge ").unwrap().to_string();
        let digest = format!("{:x}", md5::compute(format!("sekrit{}", nonce)));
        client.write_all(format!("{}\n", digest).as_bytes()).await.unwrap();

        let (_conn, ok) = manager.await.unwrap();
        assert!(ok);
    }

    #[test]
    fn test_transfer_rate_prefers_worker_history() {
        let r = TransferRate {
            worker_rate: Some(10_000_000.0),
            queue_rate: Some(1_000_000.0),
            default_rate: 100_000.0,
            outlier_factor: 10.0,
            minimum_timeout: Duration::from_secs(10),
        };
        // 100 MB at 1 MB/s tolerable = 100 seconds
        assert_eq!(r.wait_time(100_000_000), Duration::from_secs(100));
        // tiny transfers are clamped to the minimum
        assert_eq!(r.wait_time(1), Duration::from_secs(10));
    }

    #[test]
    fn test_transfer_rate_falls_back_to_default() {
        let r = TransferRate {
            worker_rate: None,
            queue_rate: None,
            default_rate: 1_000_000.0,
            outlier_factor: 10.0,
            minimum_timeout: Duration::from_secs(1),
        };
        assert_eq!(r.effective_rate(), 1_000_000.0);
    }
}
