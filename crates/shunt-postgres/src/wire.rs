//! PostgreSQL v3 wire framing and frame decoding.
//!
//! After the untyped startup handshake every message is
//! `{1-byte tag, 4-byte big-endian length including itself, body}`.
//! Frames keep their raw bytes for bit-exact replay; the decoded fields
//! exist for structural matching only.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;

use shunt_core::error::{ParseError, ParseResult};
use shunt_core::framing::MAX_FRAME_LEN;
use shunt_core::mock::{PgDecoded, PgFrame};

/// Protocol version in a v3 startup packet.
pub const PROTOCOL_V3: u32 = 196_608;
/// Magic "version" of an SSL negotiation request.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
/// Magic "version" of a cancel request.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;
/// Magic "version" of a GSSAPI encryption request.
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;

/// Tag used for untyped frames (startup packet, SSL probe answers).
pub const UNTYPED_TAG: char = '\0';

/// Take one complete untyped startup-style frame (4-byte BE length
/// including itself, no tag) off the front of `buf`.
///
/// `Ok(None)` when the buffer holds only a prefix of a frame.
pub fn take_startup_frame(buf: &mut BytesMut) -> ParseResult<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let total = BigEndian::read_u32(&buf[..4]) as usize;
    if total < 8 || total > MAX_FRAME_LEN {
        return Err(ParseError::MalformedFrame(format!(
            "startup packet length {total} out of range"
        )));
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total).to_vec()))
}

/// Take one complete typed frame (tag + length-including-itself + body)
/// off the front of `buf`, tag included.
pub fn take_typed_frame(buf: &mut BytesMut) -> ParseResult<Option<Vec<u8>>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = BigEndian::read_u32(&buf[1..5]) as usize;
    if len < 4 || len > MAX_FRAME_LEN {
        return Err(ParseError::MalformedFrame(format!(
            "frame '{}' length {len} out of range",
            buf[0] as char
        )));
    }
    if buf.len() < 1 + len {
        return Ok(None);
    }
    Ok(Some(buf.split_to(1 + len).to_vec()))
}

/// Decode a whole untyped frame into a [`PgFrame`].
pub fn decode_startup(frame: &[u8]) -> PgFrame {
    let code = BigEndian::read_u32(&frame[4..8]);
    let decoded = match code {
        SSL_REQUEST_CODE => PgDecoded::SslRequest,
        CANCEL_REQUEST_CODE => PgDecoded::CancelRequest,
        GSSENC_REQUEST_CODE => PgDecoded::Opaque,
        version => PgDecoded::Startup {
            protocol_version: version,
            parameters: startup_parameters(&frame[8..]),
        },
    };
    PgFrame {
        tag: UNTYPED_TAG,
        raw_b64: B64.encode(frame),
        decoded,
    }
}

fn startup_parameters(mut body: &[u8]) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    loop {
        let Some((key, rest)) = split_cstr(body) else {
            break;
        };
        if key.is_empty() {
            break;
        }
        let Some((value, rest)) = split_cstr(rest) else {
            break;
        };
        params.insert(key.to_string(), value.to_string());
        body = rest;
    }
    params
}

/// Decode a whole typed frame sent by the client (frontend).
pub fn decode_frontend(frame: &[u8]) -> PgFrame {
    let tag = frame[0] as char;
    let body = &frame[5..];
    let decoded = decode_frontend_body(tag, body).unwrap_or(PgDecoded::Opaque);
    PgFrame {
        tag,
        raw_b64: B64.encode(frame),
        decoded,
    }
}

/// Decode a whole typed frame sent by the server (backend).
pub fn decode_backend(frame: &[u8]) -> PgFrame {
    let tag = frame[0] as char;
    let body = &frame[5..];
    let decoded = decode_backend_body(tag, body).unwrap_or(PgDecoded::Opaque);
    PgFrame {
        tag,
        raw_b64: B64.encode(frame),
        decoded,
    }
}

/// Raw wire bytes of a stored frame.
pub fn wire_bytes(frame: &PgFrame) -> ParseResult<Vec<u8>> {
    B64.decode(&frame.raw_b64)
        .map_err(|e| ParseError::Codec(format!("stored pg frame base64: {e}")))
}

fn decode_frontend_body(tag: char, body: &[u8]) -> Option<PgDecoded> {
    let mut r = Reader(body);
    match tag {
        'P' => {
            let name = r.cstr()?;
            let query = r.cstr()?;
            let n = r.i16()?;
            let mut param_oids = Vec::new();
            for _ in 0..n.max(0) {
                param_oids.push(r.i32()? as u32);
            }
            Some(PgDecoded::Parse {
                name,
                query,
                param_oids,
            })
        }
        'B' => {
            let portal = r.cstr()?;
            let statement = r.cstr()?;
            let nfmt = r.i16()?;
            for _ in 0..nfmt.max(0) {
                r.i16()?;
            }
            let nparams = r.i16()?;
            let mut parameters_b64 = Vec::new();
            for _ in 0..nparams.max(0) {
                let len = r.i32()?;
                if len < 0 {
                    parameters_b64.push(None);
                } else {
                    parameters_b64.push(Some(B64.encode(r.bytes(len as usize)?)));
                }
            }
            Some(PgDecoded::Bind {
                portal,
                statement,
                parameters_b64,
            })
        }
        'D' => {
            let target = r.u8()? as char;
            let name = r.cstr()?;
            Some(PgDecoded::Describe { target, name })
        }
        'E' => {
            let portal = r.cstr()?;
            let max_rows = r.i32()?;
            Some(PgDecoded::Execute { portal, max_rows })
        }
        'Q' => Some(PgDecoded::Query { query: r.cstr()? }),
        'S' => Some(PgDecoded::Sync),
        'X' => Some(PgDecoded::Terminate),
        'p' => Some(PgDecoded::PasswordMessage),
        _ => None,
    }
}

fn decode_backend_body(tag: char, body: &[u8]) -> Option<PgDecoded> {
    let mut r = Reader(body);
    match tag {
        'R' => Some(PgDecoded::Authentication { code: r.i32()? }),
        'S' => {
            let name = r.cstr()?;
            let value = r.cstr()?;
            Some(PgDecoded::ParameterStatus { name, value })
        }
        'K' => Some(PgDecoded::BackendKeyData),
        'Z' => Some(PgDecoded::ReadyForQuery {
            status: r.u8()? as char,
        }),
        '1' => Some(PgDecoded::ParseComplete),
        '2' => Some(PgDecoded::BindComplete),
        '3' => Some(PgDecoded::CloseComplete),
        'T' => {
            let n = r.i16()?;
            let mut fields = Vec::new();
            for _ in 0..n.max(0) {
                fields.push(r.cstr()?);
                // table oid, attnum, type oid, typlen, typmod, format
                r.i32()?;
                r.i16()?;
                r.i32()?;
                r.i16()?;
                r.i32()?;
                r.i16()?;
            }
            Some(PgDecoded::RowDescription { fields })
        }
        'D' => {
            let n = r.i16()?;
            let mut columns_b64 = Vec::new();
            for _ in 0..n.max(0) {
                let len = r.i32()?;
                if len < 0 {
                    columns_b64.push(None);
                } else {
                    columns_b64.push(Some(B64.encode(r.bytes(len as usize)?)));
                }
            }
            Some(PgDecoded::DataRow { columns_b64 })
        }
        'C' => Some(PgDecoded::CommandComplete {
            command_tag: r.cstr()?,
        }),
        'I' => Some(PgDecoded::EmptyQueryResponse),
        'E' => {
            let mut fields = BTreeMap::new();
            while let Some(code) = r.u8() {
                if code == 0 {
                    break;
                }
                fields.insert((code as char).to_string(), r.cstr()?);
            }
            Some(PgDecoded::ErrorResponse { fields })
        }
        'N' => Some(PgDecoded::NoticeResponse),
        _ => None,
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&first, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(first)
    }

    fn i16(&mut self) -> Option<i16> {
        if self.0.len() < 2 {
            return None;
        }
        let v = BigEndian::read_i16(self.0);
        self.0 = &self.0[2..];
        Some(v)
    }

    fn i32(&mut self) -> Option<i32> {
        if self.0.len() < 4 {
            return None;
        }
        let v = BigEndian::read_i32(self.0);
        self.0 = &self.0[4..];
        Some(v)
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Some(head)
    }

    fn cstr(&mut self) -> Option<String> {
        let pos = self.0.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&self.0[..pos]).into_owned();
        self.0 = &self.0[pos + 1..];
        Some(s)
    }
}

fn split_cstr(buf: &[u8]) -> Option<(std::borrow::Cow<'_, str>, &[u8])> {
    let pos = buf.iter().position(|&b| b == 0)?;
    Some((String::from_utf8_lossy(&buf[..pos]), &buf[pos + 1..]))
}

/// Build a typed frame from tag and body (used by tests and encoders).
pub fn build_typed_frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(tag);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, (body.len() + 4) as u32);
    frame.extend_from_slice(&len);
    frame.extend_from_slice(body);
    frame
}
