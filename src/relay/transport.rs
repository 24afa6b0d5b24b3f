//! Framed transport to the proxy.
//!
//! A frame is a 4-byte big-endian payload length followed by exactly that many
//! payload bytes. Transports never retry; reconnecting is the session's job.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use super::config::Endpoint;
use super::error::{RelayError, RelayResult};
use super::protocol::MAX_FRAME_LEN;

/// Size of the frame length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// One live, ordered, reliable connection to the proxy.
#[async_trait]
pub trait Transport: Send {
    /// Write one frame and flush it.
    async fn send_frame(&mut self, payload: &[u8]) -> RelayResult<()>;

    /// Read one complete frame.
    ///
    /// Returns [`RelayError::Closed`] if the peer closed the stream on a frame
    /// boundary and [`RelayError::Io`] if it closed mid-frame.
    async fn recv_frame(&mut self) -> RelayResult<Bytes>;

    /// Release the underlying stream. Idempotent.
    async fn close(&mut self);
}

/// Opens transports to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint, timeout: Duration) -> RelayResult<Box<dyn Transport>>;
}

// ============================================================================
// Framed stream transport
// ============================================================================

/// Length-prefixed framing over any async byte stream.
pub struct FramedTransport<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: BufWriter<tokio::io::WriteHalf<S>>,
    closed: bool,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            closed: false,
        }
    }

    /// Fill `header`, distinguishing a clean close from a torn frame.
    async fn read_header(&mut self) -> RelayResult<[u8; FRAME_HEADER_LEN]> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Err(RelayError::Closed);
                }
                return Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside frame header",
                )));
            }
            filled += n;
        }
        Ok(header)
    }
}

#[async_trait]
impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send_frame(&mut self, payload: &[u8]) -> RelayResult<()> {
        if self.closed {
            return Err(RelayError::Closed);
        }
        if payload.len() > MAX_FRAME_LEN {
            return Err(RelayError::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }

        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> RelayResult<Bytes> {
        if self.closed {
            return Err(RelayError::Closed);
        }

        let header = self.read_header().await?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RelayError::protocol(format!(
                "declared frame length {} exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }

        // read_exact loops over partial reads and reports EOF as UnexpectedEof
        let mut payload = BytesMut::zeroed(len);
        self.reader.read_exact(&mut payload).await?;
        Ok(payload.freeze())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.writer.shutdown().await {
            log::debug!("transport shutdown failed: {}", e);
        }
    }
}

// ============================================================================
// Socket connector
// ============================================================================

/// Opens TCP or local-socket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn open(&self, endpoint: &Endpoint, timeout: Duration) -> RelayResult<Box<dyn Transport>> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = with_timeout(timeout, TcpStream::connect((host.as_str(), *port))).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(FramedTransport::new(stream)))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = with_timeout(timeout, tokio::net::UnixStream::connect(path)).await?;
                Ok(Box::new(FramedTransport::new(stream)))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(RelayError::config(
                "local socket endpoints are not supported on this platform",
            )),
        }
    }
}

/// Bound an I/O future; expiry becomes `Io(TimedOut)`.
pub(crate) async fn with_timeout<T, E, F>(limit: Duration, fut: F) -> RelayResult<T>
where
    F: std::future::Future<Output = Result<T, E>>,
    RelayError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RelayError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out after {:?}", limit),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut a = FramedTransport::new(client);
        let mut b = FramedTransport::new(server);

        // Larger than the duplex buffer, so reads are partial
        let payload = vec![7u8; 1000];
        let send = tokio::spawn(async move {
            a.send_frame(&payload).await.unwrap();
            a
        });
        let frame = b.recv_frame().await.unwrap();
        assert_eq!(frame.len(), 1000);
        assert!(frame.iter().all(|&x| x == 7));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_close_is_closed() {
        let (client, server) = tokio::io::duplex(64);
        let mut b = FramedTransport::new(server);
        drop(client);
        assert!(matches!(b.recv_frame().await, Err(RelayError::Closed)));
    }

    #[tokio::test]
    async fn test_torn_frame_is_io_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut b = FramedTransport::new(server);
        // Declares 10 bytes, delivers 3
        client.write_all(&[0, 0, 0, 10, 1, 2, 3]).await.unwrap();
        drop(client);
        match b.recv_frame().await {
            Err(RelayError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io error, got {:?}", other.map(|f| f.len())),
        }
    }

    #[tokio::test]
    async fn test_oversized_declared_length_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut b = FramedTransport::new(server);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(b.recv_frame().await, Err(RelayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let mut a = FramedTransport::new(client);
        a.close().await;
        a.close().await;
        assert!(matches!(a.send_frame(b"x").await, Err(RelayError::Closed)));
    }
}
