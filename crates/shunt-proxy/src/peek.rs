//! Replay-enabled reader wrapping the client socket.
//!
//! The dispatcher consumes the opening bytes of a connection to pick a
//! parser, but every parser must see the stream from byte zero. The
//! `PeekedStream` holds the consumed prefix and serves it back before
//! delegating to the underlying socket. Writes pass straight through.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::parser::BoxedStream;

/// A stream that re-presents previously peeked bytes as its first input.
pub struct PeekedStream {
    prefix: Bytes,
    pos: usize,
    inner: BoxedStream,
}

impl PeekedStream {
    pub fn new(inner: BoxedStream, prefix: Bytes) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    /// The peeked bytes (regardless of how much has been re-read).
    pub fn peeked(&self) -> &[u8] {
        &self.prefix
    }
}

impl AsyncRead for PeekedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefix_is_served_before_inner() {
        let (near, mut far) = tokio::io::duplex(64);
        far.write_all(b" world").await.unwrap();
        drop(far);

        let mut stream = PeekedStream::new(Box::new(near), Bytes::from_static(b"hello"));
        assert_eq!(stream.peeked(), b"hello");

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn short_reads_drain_prefix_incrementally() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);

        let mut stream = PeekedStream::new(Box::new(near), Bytes::from_static(b"abcdef"));
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut stream = PeekedStream::new(Box::new(near), Bytes::from_static(b"ignored"));
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        let mut out = vec![0u8; 4];
        far.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
    }
}
