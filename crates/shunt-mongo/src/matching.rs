//! Heartbeat detection and score-based matching for MongoDB messages.

use serde_json::Value;

use shunt_core::matching::map_score;
use shunt_core::mock::{MongoMessage, MongoRequest, MongoSection};

use crate::scram;

/// Minimum structural score a filtered candidate must reach.
pub const SCORE_FLOOR: f64 = 0.5;

/// Whether a decoded client message is protocol liveness traffic
/// (`hello` / `isMaster`) or a SCRAM exchange — both are reusable
/// configuration, not test payload.
pub fn is_heartbeat(message: &MongoMessage) -> bool {
    match message {
        MongoMessage::Query {
            full_collection_name,
            query,
            ..
        } => {
            full_collection_name.ends_with("admin.$cmd")
                && (has_truthy_key(query, "isMaster")
                    || has_truthy_key(query, "ismaster")
                    || query.contains("helloOk"))
        }
        MongoMessage::Msg { sections, .. } => sections.first().is_some_and(|section| {
            let MongoSection::Body { document } = section else {
                return false;
            };
            let on_admin = db_is_admin(document);
            (on_admin
                && (has_truthy_key(document, "hello") || has_truthy_key(document, "isMaster")))
                || is_scram_section(document)
        }),
        _ => false,
    }
}

/// Whether the first section of an `OP_MSG` is a SCRAM payload
/// (`saslStart` / `saslContinue`).
pub fn is_scram_section(document: &str) -> bool {
    if document.contains("saslStart") || document.contains("saslContinue") {
        return true;
    }
    // A raw payload without the command wrapper still counts when it
    // looks like a SCRAM client message.
    extract_payload(document)
        .map(|p| scram::is_client_first(&p) || scram::is_client_final(&p))
        .unwrap_or(false)
}

fn parse(document: &str) -> Option<Value> {
    serde_json::from_str(document).ok()
}

fn db_is_admin(document: &str) -> bool {
    parse(document)
        .and_then(|v| v.get("$db").and_then(|db| db.as_str().map(String::from)))
        .is_some_and(|db| db == "admin")
}

fn has_truthy_key(document: &str, key: &str) -> bool {
    let Some(value) = parse(document) else {
        return false;
    };
    match value.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        // Canonical extended JSON renders numbers as {"$numberInt": "1"}.
        Some(Value::Object(obj)) => obj
            .values()
            .next()
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .map(|n| n != 0.0)
            .unwrap_or(true),
        Some(_) => true,
        None => false,
    }
}

/// Extract the base64 `payload` binary of a SASL command document as a
/// UTF-8 string.
pub fn extract_payload(document: &str) -> Option<String> {
    let value = parse(document)?;
    let payload = value.get("payload")?;
    let b64 = payload
        .get("$binary")
        .and_then(|b| b.get("base64"))
        .and_then(Value::as_str)?;
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    String::from_utf8(bytes).ok()
}

/// Replace the `payload` binary of a SASL document, preserving the
/// rest of the document.
pub fn replace_payload(document: &str, new_payload: &str) -> Option<String> {
    use base64::Engine as _;
    let mut value = parse(document)?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(new_payload.as_bytes());
    let slot = value.get_mut("payload")?.get_mut("$binary")?.get_mut("base64")?;
    *slot = Value::String(b64);
    serde_json::to_string(&value).ok()
}

/// Score how well a stored request list matches the live one.
///
/// Each message pair contributes the structural score of its decoded
/// documents; the result is the mean over the expected list.
pub fn score_requests(expected: &[MongoRequest], actual: &[MongoRequest]) -> f64 {
    if expected.is_empty() {
        return 0.0;
    }
    let total: f64 = expected
        .iter()
        .zip(actual)
        .map(|(e, a)| score_message(&e.message, &a.message))
        .sum();
    total / expected.len() as f64
}

fn score_message(expected: &MongoMessage, actual: &MongoMessage) -> f64 {
    match (expected, actual) {
        (
            MongoMessage::Msg {
                sections: expected_sections,
                ..
            },
            MongoMessage::Msg {
                sections: actual_sections,
                ..
            },
        ) => {
            if expected_sections.is_empty() {
                return 0.0;
            }
            let total: f64 = expected_sections
                .iter()
                .zip(actual_sections)
                .map(|(e, a)| score_section(e, a))
                .sum();
            total / expected_sections.len() as f64
        }
        (
            MongoMessage::Query {
                query: expected_query,
                full_collection_name: expected_coll,
                ..
            },
            MongoMessage::Query {
                query: actual_query,
                full_collection_name: actual_coll,
                ..
            },
        ) => {
            if expected_coll != actual_coll {
                return 0.0;
            }
            score_documents(expected_query, actual_query)
        }
        (MongoMessage::Unknown { raw_b64: a }, MongoMessage::Unknown { raw_b64: b }) => {
            if a == b { 1.0 } else { 0.0 }
        }
        _ => 0.0,
    }
}

fn score_section(expected: &MongoSection, actual: &MongoSection) -> f64 {
    match (expected, actual) {
        (
            MongoSection::Body {
                document: expected_doc,
            },
            MongoSection::Body {
                document: actual_doc,
            },
        ) => score_documents(expected_doc, actual_doc),
        (
            MongoSection::DocSequence {
                identifier: expected_id,
                documents: expected_docs,
            },
            MongoSection::DocSequence {
                identifier: actual_id,
                documents: actual_docs,
            },
        ) => {
            if expected_id != actual_id || expected_docs.is_empty() {
                return 0.0;
            }
            let total: f64 = expected_docs
                .iter()
                .zip(actual_docs)
                .map(|(e, a)| score_documents(e, a))
                .sum();
            total / expected_docs.len() as f64
        }
        _ => 0.0,
    }
}

fn score_documents(expected: &str, actual: &str) -> f64 {
    match (parse(expected), parse(actual)) {
        (Some(e), Some(a)) => map_score(&e, &a),
        _ => {
            if expected == actual {
                1.0
            } else {
                0.0
            }
        }
    }
}
