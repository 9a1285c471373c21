/// Byte-stream transport to the debug stub
///
/// This module owns the socket and its read buffer. It knows nothing about
/// packets: callers describe where a unit of input ends and the transport
/// reads until that much has arrived.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{GdbError, Result};

const READ_CHUNK: usize = 4096;

/// Buffered connection to a debug stub
pub struct Transport<S = TcpStream> {
    stream: Option<S>,
    buffer: Vec<u8>,
    timeout: Duration,
}

impl Transport<TcpStream> {
    /// Open a TCP connection to the stub
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let address = format!("{}:{}", host, port);
        log::debug!("Connecting to debug stub at {}", address);

        let attempt = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)));
        let stream = match attempt.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(GdbError::Connection { address, source }),
            Err(_) => {
                return Err(GdbError::Connection {
                    address,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        stream.set_nodelay(true)?;

        log::debug!("Connected to debug stub at {}", address);
        Ok(Self::new(stream, timeout))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Wrap an already connected stream
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            buffer: Vec::new(),
            timeout,
        }
    }

    /// Default deadline for reads that are expected to complete promptly
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Bytes already read from the socket but not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Write all of `bytes`
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read until `predicate` reports how many leading buffered bytes form a
    /// complete unit, then drain and return them.
    ///
    /// With `deadline` set to `None` the call waits indefinitely.
    pub async fn receive_until<F>(
        &mut self,
        deadline: Option<Duration>,
        mut predicate: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        let end = match deadline {
            Some(limit) => tokio::time::timeout(limit, self.fill_until(&mut predicate))
                .await
                .map_err(|_| GdbError::Timeout(limit))??,
            None => self.fill_until(&mut predicate).await?,
        };
        Ok(self.buffer.drain(..end).collect())
    }

    /// Read a single byte
    pub async fn receive_byte(&mut self, deadline: Option<Duration>) -> Result<u8> {
        let bytes = self
            .receive_until(deadline, |buffered| (!buffered.is_empty()).then_some(1))
            .await?;
        Ok(bytes[0])
    }

    async fn fill_until<F>(&mut self, predicate: &mut F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        loop {
            if let Some(end) = predicate(&self.buffer) {
                return Ok(end.min(self.buffer.len()));
            }

            let stream = self.stream.as_mut().ok_or_else(not_connected)?;
            let mut chunk = [0u8; READ_CHUNK];
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                log::debug!("Debug stub closed the connection");
                return Err(GdbError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "debug stub closed the connection",
                )));
            }
            log::trace!("RAW_IN: {:?}", String::from_utf8_lossy(&chunk[..read]));
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Shut the stream down and drop any buffered input. Safe to call again.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                log::debug!("Ignoring error while closing transport: {}", e);
            }
            log::debug!("Transport closed");
        }
        self.buffer.clear();
    }
}

fn not_connected() -> GdbError {
    GdbError::Transport(io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    fn find(byte: u8) -> impl FnMut(&[u8]) -> Option<usize> {
        move |buffered| buffered.iter().position(|&b| b == byte).map(|i| i + 1)
    }

    #[tokio::test]
    async fn test_receive_until_spans_reads() {
        let mock = Builder::new().read(b"$O").read(b"K#9").read(b"a+").build();
        let mut transport = Transport::new(mock, Duration::from_secs(1));

        let frame = transport.receive_until(None, find(b'#')).await.unwrap();
        assert_eq!(frame, b"$OK#");
        assert_eq!(transport.buffered(), b"9");
        assert_eq!(transport.receive_byte(None).await.unwrap(), b'9');

        let rest = transport.receive_until(None, find(b'+')).await.unwrap();
        assert_eq!(rest, b"a+");
        assert!(transport.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_send_writes_all_bytes() {
        let mock = Builder::new().write(b"$g#67").build();
        let mut transport = Transport::new(mock, Duration::from_secs(1));
        transport.send(b"$g#67").await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (client, _stub) = tokio::io::duplex(64);
        let mut transport = Transport::new(client, Duration::from_secs(1));

        let started = std::time::Instant::now();
        let result = transport.receive_byte(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(GdbError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_receive_fails_when_peer_closes() {
        let (client, mut stub) = tokio::io::duplex(64);
        let mut transport = Transport::new(client, Duration::from_secs(1));

        stub.write_all(b"$O").await.unwrap();
        drop(stub);

        let result = transport.receive_until(None, find(b'#')).await;
        match result {
            Err(GdbError::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _stub) = tokio::io::duplex(64);
        let mut transport = Transport::new(client, Duration::from_secs(1));

        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());

        let result = transport.send(b"+").await;
        assert!(matches!(result, Err(GdbError::Transport(_))));
    }
}
