//! Transport abstraction
//!
//! The session only needs somewhere to read bytes from and somewhere to write
//! them to. Serial ports, TCP sockets and in-memory pipes all fit.

use tokio::io::{AsyncRead, AsyncWrite};

/// Readable half of a transport
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of a transport
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// A duplex byte channel split into its two halves
pub struct Transport {
    /// Bytes from the device
    pub source: ByteSource,
    /// Bytes to the device
    pub sink: ByteSink,
}

impl Transport {
    /// Bundle separate read and write halves
    pub fn new<R, W>(source: R, sink: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
        }
    }

    /// Split a bidirectional stream (serial port, socket, duplex pipe).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (source, sink) = tokio::io::split(stream);
        Self::new(source, sink)
    }

    /// Take the two halves apart
    pub fn into_parts(self) -> (ByteSource, ByteSink) {
        (self.source, self.sink)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_from_stream_round_trip() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (mut source, mut sink) = Transport::from_stream(local).into_parts();

        sink.write_all(b"IMPROV").await.unwrap();
        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"IMPROV");

        remote.write_all(&[0x01, 0x02]).await.unwrap();
        let mut buf = [0u8; 2];
        source.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x02]);
    }
}
