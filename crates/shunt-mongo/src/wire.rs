//! MongoDB wire protocol codec.
//!
//! Every message is framed by a 16-byte little-endian header
//! `{length, request_id, response_to, opcode}` where `length` covers
//! the whole frame. Documents are re-rendered as canonical extended
//! JSON so mocks serialize losslessly; encoding recomputes lengths and
//! otherwise reproduces the original bytes.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use byteorder::{ByteOrder, LittleEndian};
use bson::{Bson, Document};

use shunt_core::error::{ParseError, ParseResult};
use shunt_core::mock::{MongoHeader, MongoMessage, MongoSection};

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;

/// OP_MSG flag bits.
pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

/// Whether a decoded message carries the MoreToCome flag.
pub fn more_to_come(message: &MongoMessage) -> bool {
    matches!(message, MongoMessage::Msg { flag_bits, .. } if flag_bits & FLAG_MORE_TO_COME != 0)
}

/// Parse the 16-byte header off a full frame.
pub fn parse_header(frame: &[u8]) -> ParseResult<MongoHeader> {
    if frame.len() < HEADER_LEN {
        return Err(ParseError::MalformedFrame(format!(
            "mongo frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    Ok(MongoHeader {
        length: LittleEndian::read_i32(&frame[0..4]),
        request_id: LittleEndian::read_i32(&frame[4..8]),
        response_to: LittleEndian::read_i32(&frame[8..12]),
        opcode: LittleEndian::read_i32(&frame[12..16]),
    })
}

/// Human-readable header summary used in mock metadata.
pub fn header_summary(header: &MongoHeader) -> String {
    let op = match header.opcode {
        OP_REPLY => "OP_REPLY",
        OP_QUERY => "OP_QUERY",
        OP_MSG => "OP_MSG",
        _ => "OP_UNKNOWN",
    };
    format!(
        "{op} requestId={} responseTo={}",
        header.request_id, header.response_to
    )
}

/// Decode a full frame (header included) into its typed message.
pub fn decode_frame(frame: &[u8]) -> ParseResult<(MongoHeader, MongoMessage)> {
    let header = parse_header(frame)?;
    if header.length as usize != frame.len() {
        return Err(ParseError::MalformedFrame(format!(
            "mongo header declares {} bytes, frame has {}",
            header.length,
            frame.len()
        )));
    }
    let body = &frame[HEADER_LEN..];
    let message = match header.opcode {
        OP_MSG => decode_msg(body)?,
        OP_QUERY => decode_query(body)?,
        OP_REPLY => decode_reply(body)?,
        _ => MongoMessage::Unknown {
            raw_b64: B64.encode(body),
        },
    };
    Ok((header, message))
}

fn decode_msg(body: &[u8]) -> ParseResult<MongoMessage> {
    if body.len() < 4 {
        return Err(ParseError::MalformedFrame("OP_MSG body too short".into()));
    }
    let flag_bits = LittleEndian::read_u32(&body[0..4]);
    let mut checksum = 0u32;
    let mut end = body.len();
    if flag_bits & FLAG_CHECKSUM_PRESENT != 0 {
        if end < 8 {
            return Err(ParseError::MalformedFrame(
                "OP_MSG declares a checksum it does not carry".into(),
            ));
        }
        checksum = LittleEndian::read_u32(&body[end - 4..end]);
        end -= 4;
    }

    let mut sections = Vec::new();
    let mut offset = 4;
    while offset < end {
        let kind = body[offset];
        offset += 1;
        match kind {
            0 => {
                let (doc, used) = read_document(&body[offset..end])?;
                sections.push(MongoSection::Body {
                    document: doc_to_extjson(&doc)?,
                });
                offset += used;
            }
            1 => {
                if end - offset < 4 {
                    return Err(ParseError::MalformedFrame("truncated OP_MSG section".into()));
                }
                let section_len = LittleEndian::read_i32(&body[offset..offset + 4]) as usize;
                if section_len < 4 || offset + section_len > end {
                    return Err(ParseError::MalformedFrame(
                        "OP_MSG section length out of range".into(),
                    ));
                }
                let section = &body[offset + 4..offset + section_len];
                let zero = section
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| ParseError::MalformedFrame("unterminated identifier".into()))?;
                let identifier = String::from_utf8_lossy(&section[..zero]).into_owned();
                let mut documents = Vec::new();
                let mut inner = zero + 1;
                while inner < section.len() {
                    let (doc, used) = read_document(&section[inner..])?;
                    documents.push(doc_to_extjson(&doc)?);
                    inner += used;
                }
                sections.push(MongoSection::DocSequence {
                    identifier,
                    documents,
                });
                offset += section_len;
            }
            other => {
                return Err(ParseError::MalformedFrame(format!(
                    "unknown OP_MSG section kind {other}"
                )));
            }
        }
    }

    Ok(MongoMessage::Msg {
        flag_bits,
        sections,
        checksum,
    })
}

fn decode_query(body: &[u8]) -> ParseResult<MongoMessage> {
    if body.len() < 4 {
        return Err(ParseError::MalformedFrame("OP_QUERY body too short".into()));
    }
    let flags = LittleEndian::read_i32(&body[0..4]);
    let zero = body[4..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ParseError::MalformedFrame("unterminated collection name".into()))?;
    let full_collection_name = String::from_utf8_lossy(&body[4..4 + zero]).into_owned();
    let mut offset = 4 + zero + 1;
    if body.len() < offset + 8 {
        return Err(ParseError::MalformedFrame("OP_QUERY body too short".into()));
    }
    let number_to_skip = LittleEndian::read_i32(&body[offset..offset + 4]);
    let number_to_return = LittleEndian::read_i32(&body[offset + 4..offset + 8]);
    offset += 8;

    let (query_doc, used) = read_document(&body[offset..])?;
    offset += used;
    let query = doc_to_extjson(&query_doc)?;
    let return_fields_selector = if offset < body.len() {
        let (selector, _) = read_document(&body[offset..])?;
        Some(doc_to_extjson(&selector)?)
    } else {
        None
    };

    Ok(MongoMessage::Query {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
        return_fields_selector,
    })
}

fn decode_reply(body: &[u8]) -> ParseResult<MongoMessage> {
    if body.len() < 20 {
        return Err(ParseError::MalformedFrame("OP_REPLY body too short".into()));
    }
    let response_flags = LittleEndian::read_i32(&body[0..4]);
    let cursor_id = LittleEndian::read_i64(&body[4..12]);
    let starting_from = LittleEndian::read_i32(&body[12..16]);
    let number_returned = LittleEndian::read_i32(&body[16..20]);

    let mut documents = Vec::new();
    let mut offset = 20;
    while offset < body.len() {
        let (doc, used) = read_document(&body[offset..])?;
        documents.push(doc_to_extjson(&doc)?);
        offset += used;
    }

    Ok(MongoMessage::Reply {
        response_flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    })
}

/// Encode a message into a full frame with a recomputed length.
pub fn encode_frame(
    request_id: i32,
    response_to: i32,
    opcode_hint: i32,
    message: &MongoMessage,
) -> ParseResult<Vec<u8>> {
    let (opcode, body) = match message {
        MongoMessage::Msg {
            flag_bits,
            sections,
            checksum,
        } => (OP_MSG, encode_msg(*flag_bits, sections, *checksum)?),
        MongoMessage::Query {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        } => (
            OP_QUERY,
            encode_query(
                *flags,
                full_collection_name,
                *number_to_skip,
                *number_to_return,
                query,
                return_fields_selector.as_deref(),
            )?,
        ),
        MongoMessage::Reply {
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        } => (
            OP_REPLY,
            encode_reply(
                *response_flags,
                *cursor_id,
                *starting_from,
                *number_returned,
                documents,
            )?,
        ),
        MongoMessage::Unknown { raw_b64 } => (
            opcode_hint,
            B64.decode(raw_b64)
                .map_err(|e| ParseError::Codec(format!("stored mongo body base64: {e}")))?,
        ),
    };

    let mut frame = vec![0u8; HEADER_LEN];
    LittleEndian::write_i32(&mut frame[0..4], (HEADER_LEN + body.len()) as i32);
    LittleEndian::write_i32(&mut frame[4..8], request_id);
    LittleEndian::write_i32(&mut frame[8..12], response_to);
    LittleEndian::write_i32(&mut frame[12..16], opcode);
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn encode_msg(flag_bits: u32, sections: &[MongoSection], checksum: u32) -> ParseResult<Vec<u8>> {
    let mut body = vec![0u8; 4];
    LittleEndian::write_u32(&mut body[0..4], flag_bits);
    for section in sections {
        match section {
            MongoSection::Body { document } => {
                body.push(0);
                body.extend_from_slice(&extjson_to_doc_bytes(document)?);
            }
            MongoSection::DocSequence {
                identifier,
                documents,
            } => {
                body.push(1);
                let mut inner = Vec::new();
                inner.extend_from_slice(identifier.as_bytes());
                inner.push(0);
                for document in documents {
                    inner.extend_from_slice(&extjson_to_doc_bytes(document)?);
                }
                let mut len = [0u8; 4];
                LittleEndian::write_i32(&mut len, (inner.len() + 4) as i32);
                body.extend_from_slice(&len);
                body.extend_from_slice(&inner);
            }
        }
    }
    if flag_bits & FLAG_CHECKSUM_PRESENT != 0 {
        let mut c = [0u8; 4];
        LittleEndian::write_u32(&mut c, checksum);
        body.extend_from_slice(&c);
    }
    Ok(body)
}

fn encode_query(
    flags: i32,
    full_collection_name: &str,
    number_to_skip: i32,
    number_to_return: i32,
    query: &str,
    selector: Option<&str>,
) -> ParseResult<Vec<u8>> {
    let mut body = vec![0u8; 4];
    LittleEndian::write_i32(&mut body[0..4], flags);
    body.extend_from_slice(full_collection_name.as_bytes());
    body.push(0);
    let mut nums = [0u8; 8];
    LittleEndian::write_i32(&mut nums[0..4], number_to_skip);
    LittleEndian::write_i32(&mut nums[4..8], number_to_return);
    body.extend_from_slice(&nums);
    body.extend_from_slice(&extjson_to_doc_bytes(query)?);
    if let Some(selector) = selector {
        body.extend_from_slice(&extjson_to_doc_bytes(selector)?);
    }
    Ok(body)
}

fn encode_reply(
    response_flags: i32,
    cursor_id: i64,
    starting_from: i32,
    number_returned: i32,
    documents: &[String],
) -> ParseResult<Vec<u8>> {
    let mut body = vec![0u8; 20];
    LittleEndian::write_i32(&mut body[0..4], response_flags);
    LittleEndian::write_i64(&mut body[4..12], cursor_id);
    LittleEndian::write_i32(&mut body[12..16], starting_from);
    LittleEndian::write_i32(&mut body[16..20], number_returned);
    for document in documents {
        body.extend_from_slice(&extjson_to_doc_bytes(document)?);
    }
    Ok(body)
}

fn read_document(buf: &[u8]) -> ParseResult<(Document, usize)> {
    if buf.len() < 4 {
        return Err(ParseError::MalformedFrame("truncated BSON document".into()));
    }
    let len = LittleEndian::read_i32(&buf[0..4]) as usize;
    if len < 5 || len > buf.len() {
        return Err(ParseError::MalformedFrame(format!(
            "BSON length {len} out of range"
        )));
    }
    let doc = Document::from_reader(Cursor::new(&buf[..len]))
        .map_err(|e| ParseError::Codec(format!("bson decode: {e}")))?;
    Ok((doc, len))
}

/// Render a document as a canonical extended-JSON string.
pub fn doc_to_extjson(doc: &Document) -> ParseResult<String> {
    let value = Bson::Document(doc.clone()).into_canonical_extjson();
    serde_json::to_string(&value).map_err(|e| ParseError::Codec(format!("extjson render: {e}")))
}

/// Parse a canonical extended-JSON string back into BSON bytes.
pub fn extjson_to_doc_bytes(text: &str) -> ParseResult<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ParseError::Codec(format!("extjson parse: {e}")))?;
    let bson =
        Bson::try_from(value).map_err(|e| ParseError::Codec(format!("extjson to bson: {e}")))?;
    let Bson::Document(doc) = bson else {
        return Err(ParseError::Codec("extended JSON is not a document".into()));
    };
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes)
        .map_err(|e| ParseError::Codec(format!("bson encode: {e}")))?;
    Ok(bytes)
}

/// Parse an extended-JSON section string into a `Document`.
pub fn extjson_to_doc(text: &str) -> ParseResult<Document> {
    let bytes = extjson_to_doc_bytes(text)?;
    Document::from_reader(Cursor::new(bytes.as_slice()))
        .map_err(|e| ParseError::Codec(format!("bson re-decode: {e}")))
}
