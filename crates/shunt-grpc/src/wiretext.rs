//! Schema-less protobuf wire rendering.
//!
//! gRPC payloads are protobuf messages we have no schema for. To store
//! them in a mock they are rendered into a canonical text form that is
//! losslessly reversible:
//!
//! - varint field → `N: V` (decimal)
//! - fixed32 / fixed64 → `N: 0xHHHHHHHH` / `N: 0xHHHHHHHHHHHHHHHH`
//! - length-delimited, all printable ASCII → `N: "escaped"`
//! - length-delimited otherwise → `N: { ...nested... }`
//! - group (deprecated) → `N: !{ ...nested... }`
//! - unparsable bytes → backtick-delimited hex literal
//!
//! `parse(render(bytes)) == bytes` holds for every input: anything the
//! field walker cannot decode round-trippably (including non-minimal
//! varints) falls back to the hex literal. `parse` rejects malformed
//! text instead of guessing.

use shunt_core::error::{ParseError, ParseResult};
use shunt_core::matching::is_printable_ascii;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_GROUP_START: u64 = 3;
const WIRE_GROUP_END: u64 = 4;
const WIRE_FIXED32: u64 = 5;

// ── Rendering ──────────────────────────────────────────────────────

/// Render raw protobuf wire bytes into the canonical text form.
pub fn render(bytes: &[u8]) -> String {
    let mut out = String::new();
    render_message(bytes, 0, &mut out);
    out
}

fn render_message(bytes: &[u8], depth: usize, out: &mut String) {
    let mut pos = 0;
    while pos < bytes.len() {
        match render_field(bytes, pos, depth, out) {
            Some(next) => pos = next,
            None => {
                push_indent(depth, out);
                out.push('`');
                out.push_str(&hex::encode(&bytes[pos..]));
                out.push('`');
                out.push('\n');
                return;
            }
        }
    }
}

/// Render one field starting at `pos`; `None` means undecodable from
/// here (caller hex-dumps the rest).
fn render_field(bytes: &[u8], pos: usize, depth: usize, out: &mut String) -> Option<usize> {
    let (key, pos) = read_varint(bytes, pos)?;
    let field = key >> 3;
    let wire_type = key & 7;
    if field == 0 {
        return None;
    }

    match wire_type {
        WIRE_VARINT => {
            let (value, next) = read_varint(bytes, pos)?;
            push_indent(depth, out);
            out.push_str(&format!("{field}: {value}\n"));
            Some(next)
        }
        WIRE_FIXED64 => {
            if bytes.len() < pos + 8 {
                return None;
            }
            let value = u64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
            push_indent(depth, out);
            out.push_str(&format!("{field}: 0x{value:016x}\n"));
            Some(pos + 8)
        }
        WIRE_FIXED32 => {
            if bytes.len() < pos + 4 {
                return None;
            }
            let value = u32::from_le_bytes(bytes[pos..pos + 4].try_into().ok()?);
            push_indent(depth, out);
            out.push_str(&format!("{field}: 0x{value:08x}\n"));
            Some(pos + 4)
        }
        WIRE_LEN => {
            let (len, next) = read_varint(bytes, pos)?;
            let len = len as usize;
            if bytes.len() < next + len {
                return None;
            }
            let content = &bytes[next..next + len];
            push_indent(depth, out);
            if is_printable_ascii(content) {
                out.push_str(&format!("{field}: \"{}\"\n", escape(content)));
            } else {
                out.push_str(&format!("{field}: {{\n"));
                render_message(content, depth + 1, out);
                push_indent(depth, out);
                out.push_str("}\n");
            }
            Some(next + len)
        }
        WIRE_GROUP_START => {
            // Find the matching end-group key before committing.
            let end = find_group_end(bytes, pos, field)?;
            push_indent(depth, out);
            out.push_str(&format!("{field}: !{{\n"));
            render_message(&bytes[pos..end], depth + 1, out);
            push_indent(depth, out);
            out.push_str("}\n");
            skip_varint(bytes, end)
        }
        _ => None,
    }
}

/// Scan for the end-group key matching `field` at the same nesting
/// level. Returns the offset of the end-group key.
fn find_group_end(bytes: &[u8], mut pos: usize, field: u64) -> Option<usize> {
    while pos < bytes.len() {
        let key_pos = pos;
        let (key, next) = read_varint(bytes, pos)?;
        let inner_field = key >> 3;
        match key & 7 {
            WIRE_VARINT => {
                let (_, next) = read_varint(bytes, next)?;
                pos = next;
            }
            WIRE_FIXED64 => pos = next.checked_add(8).filter(|&p| p <= bytes.len())?,
            WIRE_FIXED32 => pos = next.checked_add(4).filter(|&p| p <= bytes.len())?,
            WIRE_LEN => {
                let (len, next) = read_varint(bytes, next)?;
                pos = next.checked_add(len as usize).filter(|&p| p <= bytes.len())?;
            }
            WIRE_GROUP_START => {
                let inner_end = find_group_end(bytes, next, inner_field)?;
                pos = skip_varint(bytes, inner_end)?;
            }
            WIRE_GROUP_END => {
                if inner_field == field {
                    return Some(key_pos);
                }
                return None;
            }
            _ => return None,
        }
    }
    None
}

/// Read a varint, rejecting non-minimal encodings so the text form
/// re-encodes to the identical bytes.
fn read_varint(bytes: &[u8], pos: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut i = pos;
    loop {
        let &b = bytes.get(i)?;
        if shift == 63 && b > 1 {
            return None; // overflow
        }
        value |= u64::from(b & 0x7f) << shift;
        i += 1;
        if b & 0x80 == 0 {
            // Non-minimal: a zero continuation byte other than the sole byte.
            if b == 0 && i - pos > 1 {
                return None;
            }
            return Some((value, i));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

fn skip_varint(bytes: &[u8], pos: usize) -> Option<usize> {
    read_varint(bytes, pos).map(|(_, next)| next)
}

fn escape(content: &[u8]) -> String {
    let mut out = String::with_capacity(content.len());
    for &b in content {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            _ => out.push(b as char),
        }
    }
    out
}

fn push_indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

// ── Parsing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(u64),
    Colon,
    Text(String),
    Hex { value: u64, wide: bool },
    Open,
    GroupOpen,
    Close,
    Blob(Vec<u8>),
}

/// Parse the canonical text form back into wire bytes.
///
/// Rejects anything `render` would not produce — there is no silent
/// hex fallback outside the backtick literal.
pub fn parse(text: &str) -> ParseResult<Vec<u8>> {
    let tokens = tokenize(text)?;
    let mut pos = 0;
    let bytes = parse_message(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(ParseError::Codec(format!(
            "trailing tokens at {pos} in wire text"
        )));
    }
    Ok(bytes)
}

fn tokenize(text: &str) -> ParseResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            b'{' => {
                tokens.push(Token::Open);
                i += 1;
            }
            b'}' => {
                tokens.push(Token::Close);
                i += 1;
            }
            b'!' => {
                if bytes.get(i + 1) != Some(&b'{') {
                    return Err(ParseError::Codec("stray '!' in wire text".into()));
                }
                tokens.push(Token::GroupOpen);
                i += 2;
            }
            b'"' => {
                let mut content = Vec::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let escaped = bytes.get(i + 1).ok_or_else(|| {
                                ParseError::Codec("unterminated escape in wire text".into())
                            })?;
                            content.push(*escaped);
                            i += 2;
                        }
                        Some(&b) => {
                            content.push(b);
                            i += 1;
                        }
                        None => {
                            return Err(ParseError::Codec(
                                "unterminated string in wire text".into(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Text(String::from_utf8_lossy(&content).into_owned()));
            }
            b'`' => {
                let start = i + 1;
                let end = bytes[start..]
                    .iter()
                    .position(|&b| b == b'`')
                    .map(|p| start + p)
                    .ok_or_else(|| {
                        ParseError::Codec("unterminated hex literal in wire text".into())
                    })?;
                let blob = hex::decode(&bytes[start..end])
                    .map_err(|e| ParseError::Codec(format!("bad hex literal: {e}")))?;
                tokens.push(Token::Blob(blob));
                i = end + 1;
            }
            b'0' if bytes.get(i + 1) == Some(&b'x') => {
                let start = i + 2;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
                    end += 1;
                }
                let digits = &text[start..end];
                let wide = match digits.len() {
                    8 => false,
                    16 => true,
                    n => {
                        return Err(ParseError::Codec(format!(
                            "hex scalar must be 8 or 16 digits, got {n}"
                        )));
                    }
                };
                let value = u64::from_str_radix(digits, 16)
                    .map_err(|e| ParseError::Codec(format!("bad hex scalar: {e}")))?;
                tokens.push(Token::Hex { value, wide });
                i = end;
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let value: u64 = text[start..i]
                    .parse()
                    .map_err(|e| ParseError::Codec(format!("bad number: {e}")))?;
                tokens.push(Token::Number(value));
            }
            other => {
                return Err(ParseError::Codec(format!(
                    "unexpected byte 0x{other:02x} in wire text"
                )));
            }
        }
    }
    Ok(tokens)
}

fn parse_message(tokens: &[Token], pos: &mut usize) -> ParseResult<Vec<u8>> {
    let mut out = Vec::new();
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Close => break,
            Token::Blob(blob) => {
                out.extend_from_slice(blob);
                *pos += 1;
            }
            Token::Number(field) => {
                let field = *field;
                *pos += 1;
                expect(tokens, pos, &Token::Colon)?;
                parse_value(tokens, pos, field, &mut out)?;
            }
            other => {
                return Err(ParseError::Codec(format!(
                    "unexpected token {other:?} in wire text"
                )));
            }
        }
    }
    Ok(out)
}

fn parse_value(
    tokens: &[Token],
    pos: &mut usize,
    field: u64,
    out: &mut Vec<u8>,
) -> ParseResult<()> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| ParseError::Codec("wire text ends after ':'".into()))?;
    match token {
        Token::Number(value) => {
            write_varint(field << 3 | WIRE_VARINT, out);
            write_varint(*value, out);
            *pos += 1;
        }
        Token::Hex { value, wide: true } => {
            write_varint(field << 3 | WIRE_FIXED64, out);
            out.extend_from_slice(&value.to_le_bytes());
            *pos += 1;
        }
        Token::Hex { value, wide: false } => {
            write_varint(field << 3 | WIRE_FIXED32, out);
            out.extend_from_slice(&(*value as u32).to_le_bytes());
            *pos += 1;
        }
        Token::Text(text) => {
            write_varint(field << 3 | WIRE_LEN, out);
            write_varint(text.len() as u64, out);
            out.extend_from_slice(text.as_bytes());
            *pos += 1;
        }
        Token::Open => {
            *pos += 1;
            let inner = parse_message(tokens, pos)?;
            expect(tokens, pos, &Token::Close)?;
            write_varint(field << 3 | WIRE_LEN, out);
            write_varint(inner.len() as u64, out);
            out.extend_from_slice(&inner);
        }
        Token::GroupOpen => {
            *pos += 1;
            let inner = parse_message(tokens, pos)?;
            expect(tokens, pos, &Token::Close)?;
            write_varint(field << 3 | WIRE_GROUP_START, out);
            out.extend_from_slice(&inner);
            write_varint(field << 3 | WIRE_GROUP_END, out);
        }
        other => {
            return Err(ParseError::Codec(format!(
                "unexpected value token {other:?} in wire text"
            )));
        }
    }
    Ok(())
}

fn expect(tokens: &[Token], pos: &mut usize, expected: &Token) -> ParseResult<()> {
    match tokens.get(*pos) {
        Some(token) if token == expected => {
            *pos += 1;
            Ok(())
        }
        other => Err(ParseError::Codec(format!(
            "expected {expected:?}, found {other:?}"
        ))),
    }
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(bytes: &[u8]) -> String {
        let text = render(bytes);
        let back = parse(&text).unwrap();
        assert_eq!(back, bytes, "round trip failed for text:\n{text}");
        text
    }

    #[test]
    fn varint_field() {
        // field 1, varint 150
        let text = round_trip(&[0x08, 0x96, 0x01]);
        assert_eq!(text, "1: 150\n");
    }

    #[test]
    fn string_field() {
        // field 2, "hello"
        let text = round_trip(&[0x12, 0x05, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(text, "2: \"hello\"\n");
    }

    #[test]
    fn string_with_quotes_escapes() {
        let payload = br#"say "hi"\now"#;
        let mut bytes = vec![0x12, payload.len() as u8];
        bytes.extend_from_slice(payload);
        round_trip(&bytes);
    }

    #[test]
    fn fixed32_and_fixed64() {
        let mut bytes = vec![0x0d]; // field 1, fixed32
        bytes.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        bytes.push(0x11); // field 2, fixed64
        bytes.extend_from_slice(&0x0102030405060708u64.to_le_bytes());
        let text = round_trip(&bytes);
        assert!(text.contains("1: 0xdeadbeef"));
        assert!(text.contains("2: 0x0102030405060708"));
    }

    #[test]
    fn nested_message() {
        // field 3 wraps (field 1, varint 5); the content bytes are not
        // printable ASCII, so the nested form is used.
        let inner = vec![0x08, 0x05];
        let mut bytes = vec![0x1a, inner.len() as u8];
        bytes.extend_from_slice(&inner);
        let text = round_trip(&bytes);
        assert!(text.contains("3: {"), "text: {text}");
        assert!(text.contains("  1: 5"));
    }

    #[test]
    fn group_field() {
        // field 4 group containing field 1 varint 5
        let bytes = vec![0x23, 0x08, 0x05, 0x24];
        let text = round_trip(&bytes);
        assert!(text.contains("4: !{"), "text: {text}");
    }

    #[test]
    fn unparsable_bytes_fall_back_to_hex() {
        // Wire type 7 is invalid.
        let bytes = vec![0x0f, 0xde, 0xad];
        let text = round_trip(&bytes);
        assert!(text.contains('`'), "text: {text}");
    }

    #[test]
    fn non_minimal_varint_falls_back_to_hex() {
        // 0x80 0x00 is a non-minimal encoding of 0.
        let bytes = vec![0x08, 0x80, 0x00];
        let text = round_trip(&bytes);
        assert!(text.contains('`'), "text: {text}");
    }

    #[test]
    fn truncated_length_falls_back_to_hex() {
        let bytes = vec![0x12, 0x10, b'x'];
        let text = round_trip(&bytes);
        assert!(text.contains('`'));
    }

    #[test]
    fn empty_payload_renders_empty() {
        assert_eq!(render(&[]), "");
        assert_eq!(parse("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn brace_after_content_on_same_line_parses() {
        // The tokenizer treats braces as their own tokens wherever they
        // appear.
        let text = "3: { 1: 5 }";
        let bytes = parse(text).unwrap();
        assert_eq!(bytes, vec![0x1a, 0x02, 0x08, 0x05]);
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(parse("1:").is_err());
        assert!(parse("1 5").is_err());
        assert!(parse("x: 5").is_err());
        assert!(parse("1: \"unterminated").is_err());
        assert!(parse("1: 0x123").is_err());
        assert!(parse("`zz`").is_err());
        assert!(parse("1: {").is_err());
    }

    #[test]
    fn grpc_style_payload() {
        // field 1: "hello", the shape of a typical unary request body.
        let bytes = [0x0a, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let text = round_trip(&bytes);
        assert_eq!(text, "1: \"hello\"\n");
    }
}
