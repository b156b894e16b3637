//! HTTP/2 header block capture and gRPC stream matching rules.

use std::collections::BTreeMap;

use http::HeaderMap;
use tracing::warn;

use shunt_core::mock::{GrpcHeaders, LengthPrefixedMessage};

use crate::wiretext;

/// Connection-level headers that never cross the proxy.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

pub fn is_connection_header(name: &str) -> bool {
    CONNECTION_HEADERS.contains(&name)
}

fn path_of(uri: &http::Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Capture a request's pseudo and ordinary headers.
pub fn capture_request(parts: &http::request::Parts) -> GrpcHeaders {
    let mut pseudo = BTreeMap::new();
    pseudo.insert(":method".to_string(), parts.method.to_string());
    pseudo.insert(":path".to_string(), path_of(&parts.uri));
    if let Some(scheme) = parts.uri.scheme_str() {
        pseudo.insert(":scheme".to_string(), scheme.to_string());
    }
    if let Some(authority) = parts.uri.authority() {
        pseudo.insert(":authority".to_string(), authority.to_string());
    }
    GrpcHeaders {
        pseudo,
        ordinary: collect_ordinary(&parts.headers),
    }
}

/// Capture a response's pseudo (`:status`) and ordinary headers.
pub fn capture_response(status: http::StatusCode, headers: &HeaderMap) -> GrpcHeaders {
    GrpcHeaders {
        pseudo: BTreeMap::from([(":status".to_string(), status.as_u16().to_string())]),
        ordinary: collect_ordinary(headers),
    }
}

/// Capture a trailer block, defaulting the gRPC status fields.
pub fn capture_trailers(trailers: Option<&HeaderMap>) -> GrpcHeaders {
    let mut ordinary = trailers.map(collect_ordinary).unwrap_or_default();
    ordinary
        .entry("grpc-status".to_string())
        .or_insert_with(|| "0".to_string());
    ordinary
        .entry("grpc-message".to_string())
        .or_insert_with(String::new);
    GrpcHeaders {
        pseudo: BTreeMap::new(),
        ordinary,
    }
}

fn collect_ordinary(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_connection_header(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Build an `http::HeaderMap` from stored ordinary headers.
pub fn to_header_map(ordinary: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in ordinary {
        let Ok(name) = http::header::HeaderName::try_from(name.as_str()) else {
            continue;
        };
        let Ok(value) = http::header::HeaderValue::try_from(value.as_str()) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

/// gRPC stream matching: exact `:method` and `:path`, `:authority`
/// permitted to differ with a warning, ordinary header keys equal, and
/// `content-type` equal exactly.
pub fn headers_match(stored: &GrpcHeaders, live: &GrpcHeaders) -> bool {
    for key in [":method", ":path"] {
        if stored.pseudo.get(key) != live.pseudo.get(key) {
            return false;
        }
    }
    if stored.pseudo.get(":authority") != live.pseudo.get(":authority") {
        warn!(
            stored = ?stored.pseudo.get(":authority"),
            live = ?live.pseudo.get(":authority"),
            "grpc :authority differs, matching anyway"
        );
    }

    let stored_keys: Vec<&String> = stored.ordinary.keys().collect();
    let live_keys: Vec<&String> = live.ordinary.keys().collect();
    if stored_keys != live_keys {
        return false;
    }
    stored.ordinary.get("content-type") == live.ordinary.get("content-type")
}

/// Similarity of two captured bodies, used to rank candidates whose
/// headers all match.
pub fn body_similarity(stored: &LengthPrefixedMessage, live: &LengthPrefixedMessage) -> f64 {
    if stored.decoded_data == live.decoded_data {
        return 1.0;
    }
    let distance = shunt_core::matching::levenshtein(&stored.decoded_data, &live.decoded_data);
    let max_len = stored.decoded_data.len().max(live.decoded_data.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (distance as f64 / max_len as f64)
}

/// Decode a concatenated gRPC body (possibly several length-prefixed
/// frames) into the stored form.
pub fn decode_body(buf: &[u8]) -> LengthPrefixedMessage {
    let mut payload = Vec::new();
    let mut compression_flag = 0u8;
    let mut pos = 0;
    while pos + 5 <= buf.len() {
        let flag = buf[pos];
        let len = u32::from_be_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], buf[pos + 4]])
            as usize;
        if pos + 5 + len > buf.len() {
            break;
        }
        compression_flag = flag;
        payload.extend_from_slice(&buf[pos + 5..pos + 5 + len]);
        pos += 5 + len;
    }
    if pos < buf.len() {
        // Ragged tail: keep the bytes so nothing is lost.
        payload.extend_from_slice(&buf[pos..]);
    }
    LengthPrefixedMessage {
        compression_flag,
        message_length: payload.len() as u32,
        decoded_data: wiretext::render(&payload),
    }
}

/// Re-encode a stored body into one length-prefixed frame.
pub fn encode_body(body: &LengthPrefixedMessage) -> shunt_core::error::ParseResult<Vec<u8>> {
    let payload = wiretext::parse(&body.decoded_data)?;
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(body.compression_flag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> GrpcHeaders {
        GrpcHeaders {
            pseudo: BTreeMap::from([
                (":method".to_string(), "POST".to_string()),
                (":path".to_string(), "/svc.M/Call".to_string()),
                (":authority".to_string(), "localhost:50051".to_string()),
            ]),
            ordinary: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn identical_headers_match() {
        let a = headers(&[("content-type", "application/grpc"), ("te", "trailers")]);
        assert!(headers_match(&a, &a.clone()));
    }

    #[test]
    fn authority_difference_still_matches() {
        let stored = headers(&[("content-type", "application/grpc")]);
        let mut live = stored.clone();
        live.pseudo
            .insert(":authority".to_string(), "other:50051".to_string());
        assert!(headers_match(&stored, &live));
    }

    #[test]
    fn path_difference_rejects() {
        let stored = headers(&[("content-type", "application/grpc")]);
        let mut live = stored.clone();
        live.pseudo
            .insert(":path".to_string(), "/svc.M/Other".to_string());
        assert!(!headers_match(&stored, &live));
    }

    #[test]
    fn header_key_difference_rejects() {
        let stored = headers(&[("content-type", "application/grpc")]);
        let live = headers(&[("content-type", "application/grpc"), ("x-extra", "1")]);
        assert!(!headers_match(&stored, &live));
    }

    #[test]
    fn content_type_value_must_match() {
        let stored = headers(&[("content-type", "application/grpc")]);
        let live = headers(&[("content-type", "application/grpc+proto")]);
        assert!(!headers_match(&stored, &live));
    }

    #[test]
    fn body_round_trip() {
        let wire = {
            let mut b = vec![0u8];
            b.extend_from_slice(&5u32.to_be_bytes());
            b.extend_from_slice(&[0x0a, 0x03, b'a', b'b', b'c']);
            b
        };
        let decoded = decode_body(&wire);
        assert_eq!(decoded.compression_flag, 0);
        assert_eq!(decoded.message_length, 5);
        assert_eq!(encode_body(&decoded).unwrap(), wire);
    }

    #[test]
    fn multi_frame_bodies_concatenate() {
        let mut wire = Vec::new();
        for payload in [&[0x08u8, 0x01][..], &[0x10, 0x02][..]] {
            wire.push(0);
            wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            wire.extend_from_slice(payload);
        }
        let decoded = decode_body(&wire);
        assert_eq!(decoded.message_length, 4);
        assert!(decoded.decoded_data.contains("1: 1"));
        assert!(decoded.decoded_data.contains("2: 2"));
    }

    #[test]
    fn trailer_defaults() {
        let trailers = capture_trailers(None);
        assert_eq!(trailers.ordinary["grpc-status"], "0");
        assert_eq!(trailers.ordinary["grpc-message"], "");
    }

    #[test]
    fn body_similarity_ranks_exact_first() {
        let a = decode_body(&{
            let mut b = vec![0u8];
            b.extend_from_slice(&5u32.to_be_bytes());
            b.extend_from_slice(&[0x0a, 0x03, b'a', b'b', b'c']);
            b
        });
        let mut similar = a.clone();
        assert!((body_similarity(&a, &similar) - 1.0).abs() < f64::EPSILON);
        similar.decoded_data = "1: \"abd\"\n".to_string();
        assert!(body_similarity(&a, &similar) < 1.0);
    }
}
