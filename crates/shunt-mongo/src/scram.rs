//! SCRAM-SHA-1 / SCRAM-SHA-256 conversation rewriting.
//!
//! A recorded authentication exchange cannot be replayed verbatim: the
//! client picks a fresh nonce every run, so the stored server nonce and
//! signature would fail the driver's proof verification. Given the
//! configured password, this module re-derives the server side of the
//! conversation around the live client's nonce while keeping the
//! recorded salt and iteration count.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use shunt_core::error::{ParseError, ParseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Sha1,
    Sha256,
}

impl Mechanism {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SCRAM-SHA-1" => Some(Mechanism::Sha1),
            "SCRAM-SHA-256" => Some(Mechanism::Sha256),
            _ => None,
        }
    }
}

/// State carried across one authentication conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub mechanism: Mechanism,
    pub username: String,
    pub client_first_bare: String,
    pub server_first: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

/// Split a SCRAM payload like `r=abc,s=xyz,i=4096` into attributes.
pub fn parse_attributes(payload: &str) -> Vec<(char, String)> {
    payload
        .split(',')
        .filter_map(|part| {
            let mut chars = part.chars();
            let key = chars.next()?;
            if chars.next() != Some('=') {
                return None;
            }
            Some((key, part[2..].to_string()))
        })
        .collect()
}

pub fn attribute(payload: &str, key: char) -> Option<String> {
    parse_attributes(payload)
        .into_iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Whether a payload is a SCRAM client-first message.
pub fn is_client_first(payload: &str) -> bool {
    (payload.starts_with("n,") || payload.starts_with("y,") || payload.starts_with("p="))
        && payload.contains("r=")
        && !payload.contains(",p=")
}

/// Whether a payload is a SCRAM client-final message.
pub fn is_client_final(payload: &str) -> bool {
    payload.contains("c=") && payload.contains("r=") && payload.contains(",p=")
}

/// The bare part of a client-first message (gs2 header stripped).
pub fn client_first_bare(payload: &str) -> &str {
    let mut offset = 0;
    let mut commas = 0;
    for (i, b) in payload.bytes().enumerate() {
        if b == b',' {
            commas += 1;
            if commas == 2 {
                offset = i + 1;
                break;
            }
        }
    }
    &payload[offset..]
}

/// Begin a conversation from the live client-first payload and the
/// recorded server side. `recorded_client_nonce` comes from the stored
/// client-first request and marks where the recorded server suffix
/// starts inside the combined nonce. Returns the conversation state and
/// the rewritten server-first to send back.
pub fn rewrite_server_first(
    mechanism: Mechanism,
    client_first: &str,
    recorded_server_first: &str,
    recorded_client_nonce: Option<&str>,
) -> ParseResult<(Conversation, String)> {
    let bare = client_first_bare(client_first);
    let client_nonce = attribute(bare, 'r')
        .ok_or_else(|| ParseError::Codec("client-first carries no nonce".into()))?;
    let username = attribute(bare, 'n').unwrap_or_default();

    let recorded_nonce = attribute(recorded_server_first, 'r')
        .ok_or_else(|| ParseError::Codec("recorded server-first carries no nonce".into()))?;
    let salt_b64 = attribute(recorded_server_first, 's')
        .ok_or_else(|| ParseError::Codec("recorded server-first carries no salt".into()))?;
    let iterations: u32 = attribute(recorded_server_first, 'i')
        .and_then(|i| i.parse().ok())
        .ok_or_else(|| ParseError::Codec("recorded server-first carries no iterations".into()))?;

    // The recorded combined nonce is recordedClientNonce + serverSuffix;
    // keep the server suffix and graft it onto the live client nonce.
    let server_suffix = recorded_suffix(recorded_client_nonce.unwrap_or(""), &recorded_nonce);
    let combined = format!("{client_nonce}{server_suffix}");

    let server_first = format!("r={combined},s={salt_b64},i={iterations}");
    let salt = B64
        .decode(&salt_b64)
        .map_err(|e| ParseError::Codec(format!("recorded salt base64: {e}")))?;

    Ok((
        Conversation {
            mechanism,
            username,
            client_first_bare: bare.to_string(),
            server_first: server_first.clone(),
            salt,
            iterations,
        },
        server_first,
    ))
}

// Without the original client-first we cannot know where the recorded
// client nonce ends; MongoDB servers append a suffix at least as long
// as the client part, so splitting in the middle is a serviceable
// fallback when the prefix is unknown.
fn recorded_suffix(recorded_client_nonce: &str, combined: &str) -> String {
    if !recorded_client_nonce.is_empty() && combined.starts_with(recorded_client_nonce) {
        return combined[recorded_client_nonce.len()..].to_string();
    }
    combined[combined.len() / 2..].to_string()
}

/// Finish a conversation: derive the server signature for the live
/// client-final message and return the rewritten server-final payload.
pub fn rewrite_server_final(
    conversation: &Conversation,
    client_final: &str,
    password: &str,
) -> ParseResult<String> {
    let without_proof = client_final
        .rsplit_once(",p=")
        .map(|(head, _)| head)
        .ok_or_else(|| ParseError::Codec("client-final carries no proof".into()))?;
    let auth_message = format!(
        "{},{},{}",
        conversation.client_first_bare, conversation.server_first, without_proof
    );

    let salted = salted_password(conversation, password)?;
    let server_key = mac(conversation.mechanism, &salted, b"Server Key")?;
    let signature = mac(conversation.mechanism, &server_key, auth_message.as_bytes())?;
    Ok(format!("v={}", B64.encode(signature)))
}

/// Verify the live client proof against the configured password.
pub fn verify_client_proof(
    conversation: &Conversation,
    client_final: &str,
    password: &str,
) -> ParseResult<bool> {
    let Some(proof_b64) = attribute(client_final, 'p') else {
        return Ok(false);
    };
    let proof = B64
        .decode(proof_b64)
        .map_err(|e| ParseError::Codec(format!("client proof base64: {e}")))?;
    let without_proof = client_final
        .rsplit_once(",p=")
        .map(|(head, _)| head)
        .unwrap_or(client_final);
    let auth_message = format!(
        "{},{},{}",
        conversation.client_first_bare, conversation.server_first, without_proof
    );

    let salted = salted_password(conversation, password)?;
    let client_key = mac(conversation.mechanism, &salted, b"Client Key")?;
    let stored_key = digest(conversation.mechanism, &client_key);
    let client_signature = mac(conversation.mechanism, &stored_key, auth_message.as_bytes())?;

    let expected: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(a, b)| a ^ b)
        .collect();
    Ok(expected == proof)
}

fn salted_password(conversation: &Conversation, password: &str) -> ParseResult<Vec<u8>> {
    match conversation.mechanism {
        Mechanism::Sha256 => {
            let mut out = vec![0u8; 32];
            pbkdf2::pbkdf2_hmac::<Sha256>(
                password.as_bytes(),
                &conversation.salt,
                conversation.iterations,
                &mut out,
            );
            Ok(out)
        }
        Mechanism::Sha1 => {
            // MongoDB hashes the credentials before salting for SHA-1.
            let digest = Md5::digest(
                format!("{}:mongo:{}", conversation.username, password).as_bytes(),
            );
            let hashed = hex::encode(digest);
            let mut out = vec![0u8; 20];
            pbkdf2::pbkdf2_hmac::<Sha1>(
                hashed.as_bytes(),
                &conversation.salt,
                conversation.iterations,
                &mut out,
            );
            Ok(out)
        }
    }
}

fn mac(mechanism: Mechanism, key: &[u8], data: &[u8]) -> ParseResult<Vec<u8>> {
    match mechanism {
        Mechanism::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .map_err(|e| ParseError::Codec(format!("hmac key: {e}")))?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        Mechanism::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key)
                .map_err(|e| ParseError::Codec(format!("hmac key: {e}")))?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

fn digest(mechanism: Mechanism, data: &[u8]) -> Vec<u8> {
    match mechanism {
        Mechanism::Sha256 => Sha256::digest(data).to_vec(),
        Mechanism::Sha1 => Sha1::digest(data).to_vec(),
    }
}
