//! RESP (REdis Serialization Protocol) codec.
//!
//! Parses wire bytes into the canonical [`RespValue`] model and encodes
//! them back bit-identically. Parsing is incremental: a value that is
//! not yet complete in the buffer reports `Ok(None)` so the caller can
//! read more bytes and retry.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use shunt_core::error::{ParseError, ParseResult};
use shunt_core::mock::{RespPayload, RespValue};

/// Try to parse one complete RESP value from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` when
/// the buffer holds only a prefix of a value.
pub fn parse_value(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        b'+' => Ok(read_line(&buf[1..])?.map(|(line, used)| {
            (
                RespValue::Simple {
                    value: String::from_utf8_lossy(line).into_owned(),
                },
                used + 1,
            )
        })),
        b'-' => Ok(read_line(&buf[1..])?.map(|(line, used)| {
            (
                RespValue::Error {
                    value: String::from_utf8_lossy(line).into_owned(),
                },
                used + 1,
            )
        })),
        b':' => {
            let Some((line, used)) = read_line(&buf[1..])? else {
                return Ok(None);
            };
            let value = parse_int(line)?;
            Ok(Some((RespValue::Integer { value }, used + 1)))
        }
        b'$' => {
            let Some((line, used)) = read_line(&buf[1..])? else {
                return Ok(None);
            };
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::NullBulk, used + 1)));
            }
            let len = len as usize;
            let start = 1 + used;
            if buf.len() < start + len + 2 {
                return Ok(None);
            }
            if &buf[start + len..start + len + 2] != b"\r\n" {
                return Err(ParseError::MalformedFrame(
                    "bulk string missing trailing CRLF".into(),
                ));
            }
            let value = RespValue::Bulk {
                value_b64: B64.encode(&buf[start..start + len]),
            };
            Ok(Some((value, start + len + 2)))
        }
        b'*' => {
            let Some((line, used)) = read_line(&buf[1..])? else {
                return Ok(None);
            };
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((RespValue::NullArray, used + 1)));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut offset = 1 + used;
            for _ in 0..count {
                let Some((item, consumed)) = parse_value(&buf[offset..])? else {
                    return Ok(None);
                };
                items.push(item);
                offset += consumed;
            }
            Ok(Some((RespValue::Array { items }, offset)))
        }
        other => Err(ParseError::MalformedFrame(format!(
            "unexpected RESP type byte 0x{other:02x}"
        ))),
    }
}

/// Encode a RESP value back to wire bytes.
pub fn encode_value(value: &RespValue, out: &mut Vec<u8>) -> ParseResult<()> {
    match value {
        RespValue::Simple { value } => {
            out.push(b'+');
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error { value } => {
            out.push(b'-');
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer { value } => {
            out.push(b':');
            out.extend_from_slice(value.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk { value_b64 } => {
            let data = B64
                .decode(value_b64)
                .map_err(|e| ParseError::Codec(format!("bulk base64: {e}")))?;
            out.push(b'$');
            out.extend_from_slice(data.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&data);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::NullBulk => out.extend_from_slice(b"$-1\r\n"),
        RespValue::NullArray => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array { items } => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out)?;
            }
        }
    }
    Ok(())
}

/// Canonical wire bytes of a payload list, used by the matcher.
pub fn canonical_bytes(payloads: &[RespPayload]) -> ParseResult<Vec<u8>> {
    let mut out = Vec::new();
    for payload in payloads {
        for value in &payload.message {
            encode_value(value, &mut out)?;
        }
    }
    Ok(out)
}

fn read_line(buf: &[u8]) -> ParseResult<Option<(&[u8], usize)>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => Ok(Some((&buf[..pos], pos + 2))),
        None => Ok(None),
    }
}

fn parse_int(line: &[u8]) -> ParseResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ParseError::MalformedFrame(format!(
                "invalid RESP integer {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(wire: &[u8]) -> RespValue {
        let (value, used) = parse_value(wire).unwrap().unwrap();
        assert_eq!(used, wire.len());
        let mut out = Vec::new();
        encode_value(&value, &mut out).unwrap();
        assert_eq!(out, wire);
        value
    }

    #[test]
    fn simple_string() {
        let value = round_trip(b"+OK\r\n");
        assert_eq!(
            value,
            RespValue::Simple {
                value: "OK".into()
            }
        );
    }

    #[test]
    fn error_and_integer() {
        round_trip(b"-ERR unknown command\r\n");
        let value = round_trip(b":-42\r\n");
        assert_eq!(value, RespValue::Integer { value: -42 });
    }

    #[test]
    fn bulk_string_binary_safe() {
        let value = round_trip(b"$5\r\nal\x00ce\r\n");
        let RespValue::Bulk { value_b64 } = &value else {
            panic!("expected bulk");
        };
        assert_eq!(B64.decode(value_b64).unwrap(), b"al\x00ce");
    }

    #[test]
    fn null_bulk_and_array() {
        assert_eq!(round_trip(b"$-1\r\n"), RespValue::NullBulk);
        assert_eq!(round_trip(b"*-1\r\n"), RespValue::NullArray);
    }

    #[test]
    fn command_array() {
        let value = round_trip(b"*2\r\n$3\r\nGET\r\n$7\r\nuser:42\r\n");
        let RespValue::Array { items } = &value else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn incomplete_values_report_none() {
        assert!(parse_value(b"").unwrap().is_none());
        assert!(parse_value(b"$5\r\nal").unwrap().is_none());
        assert!(parse_value(b"*2\r\n$3\r\nGET\r\n").unwrap().is_none());
        assert!(parse_value(b"+OK").unwrap().is_none());
    }

    #[test]
    fn malformed_type_byte_is_rejected() {
        let err = parse_value(b"GET inline\r\n").unwrap_err();
        assert!(matches!(err, ParseError::MalformedFrame(_)));
    }

    #[test]
    fn bulk_without_crlf_is_rejected() {
        let err = parse_value(b"$3\r\nabcXY").unwrap_err();
        assert!(matches!(err, ParseError::MalformedFrame(_)));
    }
}
