//! HTTP/1.x message reading over buffered async streams.
//!
//! Messages are read whole: head (via httparse) plus body according to
//! `Content-Length`, chunked transfer coding, or read-until-close. The
//! raw bytes are kept alongside the decoded form so record mode can
//! forward traffic verbatim.

use std::collections::BTreeMap;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use shunt_core::error::{ParseError, ParseResult};

/// Maximum bytes we will buffer for one message head.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// A fully read request or response.
#[derive(Debug)]
pub struct HttpMessage {
    /// Verbatim bytes as seen on the wire (head + body).
    pub raw: Vec<u8>,
    /// Decoded body (chunk framing removed).
    pub body: Vec<u8>,
    pub head: Head,
}

/// Decoded head fields shared by requests and responses.
#[derive(Debug)]
pub struct Head {
    /// Request line method, empty for responses.
    pub method: String,
    /// Request target, empty for responses.
    pub path: String,
    /// Response status code, 0 for requests.
    pub status: u16,
    /// Response reason phrase, empty for requests.
    pub reason: String,
    pub version_minor: u8,
    pub headers: BTreeMap<String, String>,
}

impl Head {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }
}

/// Read one request from the stream. `Ok(None)` on clean close before
/// the first byte.
pub async fn read_request<R>(reader: &mut R, acc: &mut BytesMut) -> ParseResult<Option<HttpMessage>>
where
    R: AsyncRead + Unpin,
{
    let Some(head_len) = fill_until_head(reader, acc).await? else {
        return Ok(None);
    };
    let head_bytes = acc.split_to(head_len).to_vec();

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed
        .parse(&head_bytes)
        .map_err(|e| ParseError::MalformedFrame(format!("http request head: {e}")))?;
    if !status.is_complete() {
        return Err(ParseError::MalformedFrame("http head did not terminate".into()));
    }

    let head = Head {
        method: parsed.method.unwrap_or("").to_string(),
        path: parsed.path.unwrap_or("").to_string(),
        status: 0,
        reason: String::new(),
        version_minor: parsed.version.unwrap_or(1) as u8,
        headers: collect_headers(parsed.headers),
    };
    let message = read_body(reader, acc, head, head_bytes, false).await?;
    Ok(Some(message))
}

/// Read one response from the stream. `head_allows_body` is false for
/// replies to HEAD requests.
pub async fn read_response<R>(
    reader: &mut R,
    acc: &mut BytesMut,
    head_request: bool,
) -> ParseResult<Option<HttpMessage>>
where
    R: AsyncRead + Unpin,
{
    let Some(head_len) = fill_until_head(reader, acc).await? else {
        return Ok(None);
    };
    let head_bytes = acc.split_to(head_len).to_vec();

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);
    let status = parsed
        .parse(&head_bytes)
        .map_err(|e| ParseError::MalformedFrame(format!("http response head: {e}")))?;
    if !status.is_complete() {
        return Err(ParseError::MalformedFrame("http head did not terminate".into()));
    }

    let code = parsed.code.unwrap_or(0);
    let head = Head {
        method: String::new(),
        path: String::new(),
        status: code,
        reason: parsed.reason.unwrap_or("").to_string(),
        version_minor: parsed.version.unwrap_or(1) as u8,
        headers: collect_headers(parsed.headers),
    };
    let bodyless = head_request || code < 200 || code == 204 || code == 304;
    let message = read_body(reader, acc, head, head_bytes, bodyless).await?;
    Ok(Some(message))
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

async fn fill_until_head<R>(reader: &mut R, acc: &mut BytesMut) -> ParseResult<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        if let Some(pos) = find_head_end(acc) {
            return Ok(Some(pos));
        }
        if acc.len() > MAX_HEAD_LEN {
            return Err(ParseError::MalformedFrame("http head exceeds 64 KiB".into()));
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if acc.is_empty() {
                return Ok(None);
            }
            return Err(ParseError::UnexpectedEof);
        }
        acc.extend_from_slice(&buf[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

async fn read_body<R>(
    reader: &mut R,
    acc: &mut BytesMut,
    head: Head,
    head_bytes: Vec<u8>,
    bodyless: bool,
) -> ParseResult<HttpMessage>
where
    R: AsyncRead + Unpin,
{
    let mut raw = head_bytes;
    let mut body = Vec::new();

    if !bodyless {
        if head.is_chunked() {
            read_chunked(reader, acc, &mut raw, &mut body).await?;
        } else if let Some(len) = head.content_length() {
            let chunk = take_exact(reader, acc, len).await?;
            raw.extend_from_slice(&chunk);
            body = chunk;
        } else if head.status != 0 {
            // Response with neither framing header: body runs to close.
            let mut rest = acc.split().to_vec();
            reader.read_to_end(&mut rest).await?;
            raw.extend_from_slice(&rest);
            body = rest;
        }
    }

    Ok(HttpMessage { raw, body, head })
}

async fn read_chunked<R>(
    reader: &mut R,
    acc: &mut BytesMut,
    raw: &mut Vec<u8>,
    body: &mut Vec<u8>,
) -> ParseResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = take_line(reader, acc).await?;
        raw.extend_from_slice(&line);
        let size_text = String::from_utf8_lossy(&line);
        let size_text = size_text.trim_end();
        let size_text = size_text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ParseError::MalformedFrame(format!("bad chunk size {size_text:?}")))?;

        if size == 0 {
            // Trailer section: lines until the blank one.
            loop {
                let line = take_line(reader, acc).await?;
                raw.extend_from_slice(&line);
                if line == b"\r\n" {
                    return Ok(());
                }
            }
        }
        let chunk = take_exact(reader, acc, size + 2).await?;
        if &chunk[size..] != b"\r\n" {
            return Err(ParseError::MalformedFrame("chunk missing trailing CRLF".into()));
        }
        raw.extend_from_slice(&chunk);
        body.extend_from_slice(&chunk[..size]);
    }
}

async fn take_line<R>(reader: &mut R, acc: &mut BytesMut) -> ParseResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 1024];
    loop {
        if let Some(pos) = acc.windows(2).position(|w| w == b"\r\n") {
            return Ok(acc.split_to(pos + 2).to_vec());
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ParseError::UnexpectedEof);
        }
        acc.extend_from_slice(&buf[..n]);
    }
}

async fn take_exact<R>(reader: &mut R, acc: &mut BytesMut, len: usize) -> ParseResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    while acc.len() < len {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ParseError::UnexpectedEof);
        }
        acc.extend_from_slice(&buf[..n]);
    }
    Ok(acc.split_to(len).to_vec())
}
