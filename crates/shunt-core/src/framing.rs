//! Length-prefixed frame readers over async streams.
//!
//! Every wire protocol here frames messages with a length prefix; these
//! helpers centralize the "read exactly N or fail loudly" logic and the
//! distinction between a clean peer close (zero bytes at a frame
//! boundary) and a truncation mid-frame.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ParseError, ParseResult};

/// Upper bound on any single frame we are willing to buffer.
pub const MAX_FRAME_LEN: usize = 48 * 1024 * 1024;

/// Fill `buf` completely.
///
/// Returns `Ok(false)` when the peer closed before the first byte (a
/// clean end-of-stream at a frame boundary); `UnexpectedEof` when the
/// stream ends with the buffer partially filled.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> ParseResult<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ParseError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(true)
}

/// Read one MongoDB-style frame: a 4-byte little-endian total length
/// (including the prefix itself) followed by the body.
///
/// The returned buffer contains the whole frame, prefix included, so it
/// can be forwarded verbatim. `Ok(None)` means clean end-of-stream.
pub async fn read_frame_len_le<R>(reader: &mut R) -> ParseResult<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    if !read_full(reader, &mut prefix).await? {
        return Ok(None);
    }
    let total = LittleEndian::read_u32(&prefix) as usize;
    if total < 4 {
        return Err(ParseError::MalformedFrame(format!(
            "declared length {total} is shorter than its own prefix"
        )));
    }
    if total > MAX_FRAME_LEN {
        return Err(ParseError::MalformedFrame(format!(
            "declared length {total} exceeds the {MAX_FRAME_LEN} byte cap"
        )));
    }
    let mut frame = BytesMut::zeroed(total);
    frame[..4].copy_from_slice(&prefix);
    if !read_full(reader, &mut frame[4..]).await? {
        return Err(ParseError::UnexpectedEof);
    }
    Ok(Some(frame))
}

/// Read one PostgreSQL-style untyped frame: a 4-byte big-endian total
/// length (including the prefix itself) followed by the body.
pub async fn read_frame_len_be<R>(reader: &mut R) -> ParseResult<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    if !read_full(reader, &mut prefix).await? {
        return Ok(None);
    }
    let total = BigEndian::read_u32(&prefix) as usize;
    if total < 4 {
        return Err(ParseError::MalformedFrame(format!(
            "declared length {total} is shorter than its own prefix"
        )));
    }
    if total > MAX_FRAME_LEN {
        return Err(ParseError::MalformedFrame(format!(
            "declared length {total} exceeds the {MAX_FRAME_LEN} byte cap"
        )));
    }
    let mut frame = BytesMut::zeroed(total);
    frame[..4].copy_from_slice(&prefix);
    if !read_full(reader, &mut frame[4..]).await? {
        return Err(ParseError::UnexpectedEof);
    }
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_full_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut reader = client;
        let mut buf = [0u8; 8];
        assert!(!read_full(&mut reader, &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn read_full_partial_is_error() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"abc").await.unwrap();
        drop(server);
        let mut reader = client;
        let mut buf = [0u8; 8];
        let err = read_full(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
    }

    #[tokio::test]
    async fn le_frame_round_trip() {
        let (client, mut server) = tokio::io::duplex(64);
        // 9-byte frame: 4-byte LE length + "hello".
        server.write_all(&[9, 0, 0, 0]).await.unwrap();
        server.write_all(b"hello").await.unwrap();
        drop(server);
        let mut reader = client;
        let frame = read_frame_len_le(&mut reader).await.unwrap().unwrap();
        assert_eq!(&frame[4..], b"hello");
        assert!(read_frame_len_le(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn le_frame_rejects_short_length() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(&[2, 0, 0, 0]).await.unwrap();
        drop(server);
        let mut reader = client;
        let err = read_frame_len_le(&mut reader).await.unwrap_err();
        assert!(matches!(err, ParseError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn be_frame_round_trip() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0, 0, 0, 8]).await.unwrap();
        server.write_all(b"ping").await.unwrap();
        drop(server);
        let mut reader = client;
        let frame = read_frame_len_be(&mut reader).await.unwrap().unwrap();
        assert_eq!(&frame[4..], b"ping");
    }

    #[tokio::test]
    async fn be_frame_truncated_body_is_error() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0, 0, 0, 16]).await.unwrap();
        server.write_all(b"xx").await.unwrap();
        drop(server);
        let mut reader = client;
        let err = read_frame_len_be(&mut reader).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
    }
}
