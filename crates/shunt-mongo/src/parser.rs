//! MongoDB record/replay state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::{ParseError, ParseResult};
use shunt_core::framing::read_frame_len_le;
use shunt_core::mock::{
    self, Mock, MockKind, MockSpec, MongoMessage, MongoRequest, MongoResponse, MongoSection,
    ProtocolPayload, META_CONNECTION_ID, META_OPERATION,
};
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::{BoxedStream, ProtocolParser};
use shunt_proxy::peek::PeekedStream;
use shunt_store::{MockEntry, MockStore};

use crate::matching::{self, SCORE_FLOOR};
use crate::scram;
use crate::wire;

/// Fresh request ids for replayed server frames.
static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1_000);

fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Default)]
pub struct MongoParser;

#[async_trait]
impl ProtocolParser for MongoParser {
    fn name(&self) -> &'static str {
        "mongo"
    }

    fn kind(&self) -> MockKind {
        MockKind::Mongo
    }

    fn match_type(&self, peeked: &[u8]) -> bool {
        if peeked.len() < wire::HEADER_LEN {
            return false;
        }
        let length = LittleEndian::read_i32(&peeked[0..4]);
        let opcode = LittleEndian::read_i32(&peeked[12..16]);
        (wire::HEADER_LEN as i32..=48 * 1024 * 1024).contains(&length)
            && matches!(opcode, 1 | 2001..=2013)
    }

    async fn record_outgoing(
        &self,
        mut client: PeekedStream,
        mut dest: BoxedStream,
        ctx: &ConnContext,
        sink: &MockSink,
        _opts: &Options,
    ) -> ParseResult<()> {
        let mut last_client_read = Instant::now();
        let mut last_dest_read = Instant::now();

        loop {
            // ── Request frames (MoreToCome keeps the list growing) ──
            let frame = tokio::select! {
                f = read_frame_len_le(&mut client) => f?,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            let delay = last_client_read.elapsed().as_nanos() as i64;
            last_client_read = Instant::now();
            let (header, message) = wire::decode_frame(&frame)?;
            dest.write_all(&frame).await?;

            let mut more = wire::more_to_come(&message);
            let mut requests = vec![MongoRequest {
                header,
                message,
                read_delay_ns: delay,
            }];
            while more {
                let Some(frame) = read_frame_len_le(&mut client).await? else {
                    return Ok(());
                };
                let delay = last_client_read.elapsed().as_nanos() as i64;
                last_client_read = Instant::now();
                let (header, message) = wire::decode_frame(&frame)?;
                dest.write_all(&frame).await?;
                more = wire::more_to_come(&message);
                requests.push(MongoRequest {
                    header,
                    message,
                    read_delay_ns: delay,
                });
            }
            dest.flush().await?;

            // ── Response frames ────────────────────────────────────
            let Some(frame) = read_frame_len_le(&mut dest).await? else {
                return Ok(());
            };
            let delay = last_dest_read.elapsed().as_nanos() as i64;
            last_dest_read = Instant::now();
            let (header, message) = wire::decode_frame(&frame)?;
            client.write_all(&frame).await?;

            let mut more = wire::more_to_come(&message);
            let mut responses = vec![MongoResponse {
                header,
                message,
                read_delay_ns: delay,
            }];
            while more {
                let Some(frame) = read_frame_len_le(&mut dest).await? else {
                    break;
                };
                let delay = last_dest_read.elapsed().as_nanos() as i64;
                last_dest_read = Instant::now();
                let (header, message) = wire::decode_frame(&frame)?;
                client.write_all(&frame).await?;
                more = wire::more_to_come(&message);
                responses.push(MongoResponse {
                    header,
                    message,
                    read_delay_ns: delay,
                });
            }
            client.flush().await?;

            emit(sink, ctx, requests, responses).await;
        }
    }

    async fn mock_outgoing(
        &self,
        mut client: PeekedStream,
        _dst: Option<&ConditionalDstCfg>,
        store: Arc<MockStore>,
        ctx: &ConnContext,
        opts: &Options,
    ) -> ParseResult<()> {
        let mut conversation: Option<scram::Conversation> = None;

        loop {
            let frame = tokio::select! {
                f = read_frame_len_le(&mut client) => f?,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            let (header, message) = wire::decode_frame(&frame)?;
            let mut more = wire::more_to_come(&message);
            let mut requests = vec![MongoRequest {
                header,
                message,
                read_delay_ns: 0,
            }];
            while more {
                let Some(frame) = read_frame_len_le(&mut client).await? else {
                    return Ok(());
                };
                let (header, message) = wire::decode_frame(&frame)?;
                more = wire::more_to_come(&message);
                requests.push(MongoRequest {
                    header,
                    message,
                    read_delay_ns: 0,
                });
            }

            let heartbeat = matching::is_heartbeat(&requests[0].message);
            let (stored_requests, mut responses) = if heartbeat {
                match_unfiltered(&store, &requests)?
            } else {
                match_filtered(&store, &requests)?
            };

            if let Some(password) = &opts.mongo_password {
                rewrite_auth(
                    &requests,
                    &stored_requests,
                    &mut responses,
                    &mut conversation,
                    password,
                )?;
            }

            let response_to = requests.last().map(|r| r.header.request_id).unwrap_or(0);
            for response in &responses {
                let frame = wire::encode_frame(
                    next_request_id(),
                    response_to,
                    response.header.opcode,
                    &response.message,
                )?;
                client.write_all(&frame).await?;
            }
            client.flush().await?;
        }
    }
}

async fn emit(
    sink: &MockSink,
    ctx: &ConnContext,
    requests: Vec<MongoRequest>,
    responses: Vec<MongoResponse>,
) {
    if requests.is_empty() || responses.is_empty() {
        return;
    }
    let heartbeat = matching::is_heartbeat(&requests[0].message);
    let operation = wire::header_summary(&requests[0].header);
    let order = mock::next_sort_order();
    let spec = MockSpec::new(ProtocolPayload::Mongo {
        requests,
        responses,
    })
    .with_meta(META_OPERATION, operation)
    .with_meta(META_CONNECTION_ID, ctx.client_conn_id.clone());
    let mut mock = Mock::new(MockKind::Mongo, format!("mongo-{order}"), spec, order);
    if heartbeat {
        mock = mock.into_config();
    }
    sink.send(mock).await;
}

fn mongo_payload(entry: &MockEntry) -> Option<(&Vec<MongoRequest>, &Vec<MongoResponse>)> {
    match &entry.mock.spec.payload {
        ProtocolPayload::Mongo {
            requests,
            responses,
        } => Some((requests, responses)),
        _ => None,
    }
}

/// Heartbeat path: best scorer in the unfiltered partition, marked used
/// through the CAS that pins its sort order to the end. The mock stays
/// in the partition for the rest of the replay.
fn match_unfiltered(
    store: &MockStore,
    requests: &[MongoRequest],
) -> ParseResult<(Vec<MongoRequest>, Vec<MongoResponse>)> {
    loop {
        let entries = store.get_unfiltered();
        let mut best: Option<(&MockEntry, f64)> = None;
        for entry in &entries {
            if entry.mock.kind != MockKind::Mongo {
                continue;
            }
            let Some((stored_requests, _)) = mongo_payload(entry) else {
                continue;
            };
            let score = matching::score_requests(stored_requests, requests);
            // Strict comparison keeps the earliest sort order on ties.
            if score > 0.0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((entry, score));
            }
        }
        let Some((entry, score)) = best else {
            return Err(ParseError::NoMatch {
                operation: "mongo heartbeat".into(),
            });
        };
        debug!(mock = %entry.mock.name, score, "heartbeat matched");

        let mut next = (*entry.mock).clone();
        next.test_mode_info.sort_order = i64::MAX;
        if !store.update_unfiltered(entry, next) {
            // Concurrent matcher touched the entry; re-read and rescan.
            continue;
        }
        if let Err(e) = store.flag_as_used(entry) {
            warn!("failed to flag heartbeat mock as used: {e}");
        }
        let (stored_requests, responses) = mongo_payload(entry).expect("checked above");
        return Ok((stored_requests.clone(), responses.clone()));
    }
}

/// Regular path: best scorer in the filtered partition, consumed.
fn match_filtered(
    store: &MockStore,
    requests: &[MongoRequest],
) -> ParseResult<(Vec<MongoRequest>, Vec<MongoResponse>)> {
    loop {
        let entries = store.get_filtered();
        let mut best: Option<(&MockEntry, f64)> = None;
        for entry in &entries {
            if entry.mock.kind != MockKind::Mongo {
                continue;
            }
            let Some((stored_requests, _)) = mongo_payload(entry) else {
                continue;
            };
            let score = matching::score_requests(stored_requests, requests);
            if score >= SCORE_FLOOR && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((entry, score));
            }
        }
        let Some((entry, score)) = best else {
            return Err(ParseError::NoMatch {
                operation: requests
                    .first()
                    .map(|r| wire::header_summary(&r.header))
                    .unwrap_or_default(),
            });
        };
        debug!(mock = %entry.mock.name, score, "mongo request matched");

        if !store.delete_filtered(entry) {
            continue;
        }
        let (stored_requests, responses) = mongo_payload(entry).expect("checked above");
        return Ok((stored_requests.clone(), responses.clone()));
    }
}

fn first_body_document(message: &MongoMessage) -> Option<&str> {
    match message {
        MongoMessage::Msg { sections, .. } => sections.iter().find_map(|s| match s {
            MongoSection::Body { document } => Some(document.as_str()),
            MongoSection::DocSequence { .. } => None,
        }),
        _ => None,
    }
}

fn first_body_document_mut(message: &mut MongoMessage) -> Option<&mut String> {
    match message {
        MongoMessage::Msg { sections, .. } => sections.iter_mut().find_map(|s| match s {
            MongoSection::Body { document } => Some(document),
            MongoSection::DocSequence { .. } => None,
        }),
        _ => None,
    }
}

/// Rewrite a SCRAM response so the live client's proof verification
/// succeeds against the configured password.
fn rewrite_auth(
    requests: &[MongoRequest],
    stored_requests: &[MongoRequest],
    responses: &mut [MongoResponse],
    conversation: &mut Option<scram::Conversation>,
    password: &str,
) -> ParseResult<()> {
    let Some(live_doc) = requests.first().and_then(|r| first_body_document(&r.message)) else {
        return Ok(());
    };
    let Some(live_payload) = matching::extract_payload(live_doc) else {
        return Ok(());
    };
    let Some(response_doc) = responses
        .first_mut()
        .and_then(|r| first_body_document_mut(&mut r.message))
    else {
        return Ok(());
    };

    if scram::is_client_first(&live_payload) {
        let mechanism = mechanism_of(live_doc).unwrap_or(scram::Mechanism::Sha256);
        let Some(stored_server_first) = matching::extract_payload(response_doc) else {
            return Ok(());
        };
        let recorded_client_nonce = stored_requests
            .first()
            .and_then(|r| first_body_document(&r.message))
            .and_then(matching::extract_payload)
            .as_deref()
            .map(scram::client_first_bare)
            .and_then(|bare| scram::attribute(bare, 'r'));

        let (state, server_first) = scram::rewrite_server_first(
            mechanism,
            &live_payload,
            &stored_server_first,
            recorded_client_nonce.as_deref(),
        )?;
        if let Some(rewritten) = matching::replace_payload(response_doc, &server_first) {
            *response_doc = rewritten;
        }
        *conversation = Some(state);
        debug!("scram server-first rewritten");
    } else if scram::is_client_final(&live_payload) {
        let Some(state) = conversation.as_ref() else {
            return Ok(());
        };
        match scram::verify_client_proof(state, &live_payload, password) {
            Ok(true) => {}
            Ok(false) => warn!("scram client proof did not verify against the configured password"),
            Err(e) => warn!("scram proof verification failed: {e}"),
        }
        let server_final = scram::rewrite_server_final(state, &live_payload, password)?;
        if let Some(rewritten) = matching::replace_payload(response_doc, &server_final) {
            *response_doc = rewritten;
        }
        debug!("scram server-final rewritten");
    }
    Ok(())
}

fn mechanism_of(document: &str) -> Option<scram::Mechanism> {
    let value: serde_json::Value = serde_json::from_str(document).ok()?;
    scram::Mechanism::from_name(value.get("mechanism")?.as_str()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ConnContext {
        ConnContext::new("127.0.0.1", CancellationToken::new())
    }

    fn frame(request_id: i32, response_to: i32, document: bson::Document) -> Vec<u8> {
        let mut doc_bytes = Vec::new();
        document.to_writer(&mut doc_bytes).unwrap();
        let mut out = vec![0u8; wire::HEADER_LEN];
        LittleEndian::write_i32(&mut out[4..8], request_id);
        LittleEndian::write_i32(&mut out[8..12], response_to);
        LittleEndian::write_i32(&mut out[12..16], wire::OP_MSG);
        out.extend_from_slice(&[0, 0, 0, 0]); // flags
        out.push(0);
        out.extend_from_slice(&doc_bytes);
        let total = out.len() as i32;
        LittleEndian::write_i32(&mut out[0..4], total);
        out
    }

    fn decoded(request_id: i32, document: bson::Document) -> (MongoRequest, Vec<u8>) {
        let raw = frame(request_id, 0, document);
        let (header, message) = wire::decode_frame(&raw).unwrap();
        (
            MongoRequest {
                header,
                message,
                read_delay_ns: 0,
            },
            raw,
        )
    }

    fn heartbeat_mock() -> (Mock, Vec<u8>) {
        let (request, raw) = decoded(7, doc! {"hello": 1, "$db": "admin"});
        let reply_raw = frame(900, 7, doc! {"helloOk": true, "maxWireVersion": 17, "ok": 1.0});
        let (reply_header, reply_message) = wire::decode_frame(&reply_raw).unwrap();
        let mock = Mock::new(
            MockKind::Mongo,
            "mongo-hb",
            MockSpec::new(ProtocolPayload::Mongo {
                requests: vec![request],
                responses: vec![MongoResponse {
                    header: reply_header,
                    message: reply_message,
                    read_delay_ns: 0,
                }],
            }),
            0,
        )
        .into_config();
        (mock, raw)
    }

    #[tokio::test]
    async fn heartbeat_replay_is_reusable() {
        let (mock, request_raw) = heartbeat_mock();
        let store = Arc::new(MockStore::new());
        store.load(vec![mock]).unwrap();

        let (near, mut far) = tokio::io::duplex(16 * 1024);
        let parser = MongoParser;
        let ctx = ctx();
        let store_clone = Arc::clone(&store);
        let replay = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(near), Bytes::new());
            parser
                .mock_outgoing(client, None, store_clone, &ctx, &Options::default())
                .await
        });

        // The same heartbeat twice: the config mock must serve both.
        for _ in 0..2 {
            tokio::io::AsyncWriteExt::write_all(&mut far, &request_raw)
                .await
                .unwrap();
            let mut len = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut far, &mut len)
                .await
                .unwrap();
            let total = LittleEndian::read_i32(&len) as usize;
            let mut rest = vec![0u8; total - 4];
            tokio::io::AsyncReadExt::read_exact(&mut far, &mut rest)
                .await
                .unwrap();

            let mut full = len.to_vec();
            full.extend_from_slice(&rest);
            let (header, message) = wire::decode_frame(&full).unwrap();
            // response_to points at the live request id.
            assert_eq!(header.response_to, 7);
            let MongoMessage::Msg { sections, .. } = &message else {
                panic!("expected OP_MSG reply");
            };
            let MongoSection::Body { document } = &sections[0] else {
                panic!("expected body section");
            };
            assert!(document.contains("helloOk"));
        }

        // Still present after both replays.
        assert_eq!(store.unfiltered_len(), 1);
        assert_eq!(store.used_names(), vec!["mongo-hb".to_string()]);

        drop(far);
        replay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn find_is_consumed_from_filtered() {
        let (request, request_raw) =
            decoded(21, doc! {"find": "users", "filter": {"id": 42}, "$db": "orders"});
        let reply_raw = frame(901, 21, doc! {"cursor": {"firstBatch": [{"name": "alice"}]}, "ok": 1.0});
        let (reply_header, reply_message) = wire::decode_frame(&reply_raw).unwrap();
        let mock = Mock::new(
            MockKind::Mongo,
            "mongo-1",
            MockSpec::new(ProtocolPayload::Mongo {
                requests: vec![request],
                responses: vec![MongoResponse {
                    header: reply_header,
                    message: reply_message,
                    read_delay_ns: 0,
                }],
            }),
            1,
        );
        let store = Arc::new(MockStore::new());
        store.load(vec![mock]).unwrap();

        let (near, mut far) = tokio::io::duplex(16 * 1024);
        let parser = MongoParser;
        let ctx = ctx();
        let store_clone = Arc::clone(&store);
        let replay = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(near), Bytes::new());
            parser
                .mock_outgoing(client, None, store_clone, &ctx, &Options::default())
                .await
        });

        tokio::io::AsyncWriteExt::write_all(&mut far, &request_raw)
            .await
            .unwrap();
        let mut len = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut len)
            .await
            .unwrap();
        let total = LittleEndian::read_i32(&len) as usize;
        let mut rest = vec![0u8; total - 4];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut rest)
            .await
            .unwrap();

        assert_eq!(store.filtered_len(), 0, "mock must be consumed");

        drop(far);
        replay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn record_emits_heartbeat_as_config() {
        let (client_near, mut client_far) = tokio::io::duplex(16 * 1024);
        let (dest_near, mut dest_far) = tokio::io::duplex(16 * 1024);
        let (sink, mut rx) = MockSink::channel(8);

        let parser = MongoParser;
        let ctx = ctx();
        let record = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(client_near), Bytes::new());
            parser
                .record_outgoing(client, Box::new(dest_near), &ctx, &sink, &Options::default())
                .await
        });

        let request_raw = frame(7, 0, doc! {"hello": 1, "$db": "admin"});
        tokio::io::AsyncWriteExt::write_all(&mut client_far, &request_raw)
            .await
            .unwrap();
        let mut fwd = vec![0u8; request_raw.len()];
        tokio::io::AsyncReadExt::read_exact(&mut dest_far, &mut fwd)
            .await
            .unwrap();
        assert_eq!(fwd, request_raw);

        let reply_raw = frame(900, 7, doc! {"helloOk": true, "ok": 1.0});
        tokio::io::AsyncWriteExt::write_all(&mut dest_far, &reply_raw)
            .await
            .unwrap();
        let mut back = vec![0u8; reply_raw.len()];
        tokio::io::AsyncReadExt::read_exact(&mut client_far, &mut back)
            .await
            .unwrap();
        assert_eq!(back, reply_raw);

        let mock = rx.recv().await.unwrap();
        assert_eq!(mock.kind, MockKind::Mongo);
        assert!(mock.is_config());
        assert!(mock.operation().starts_with("OP_MSG"));

        drop(client_far);
        drop(dest_far);
        record.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn scram_exchange_is_rewritten_for_fresh_nonce() {
        use base64::Engine as _;
        use base64::engine::general_purpose::STANDARD as B64;

        // Recorded conversation used client nonce "old"; live uses "abc".
        let (auth_request, _) = decoded(
            31,
            doc! {
                "saslStart": 1,
                "mechanism": "SCRAM-SHA-256",
                "payload": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: b"n,,n=alice,r=old".to_vec() },
                "$db": "admin",
            },
        );
        let server_first = "r=oldSERVERNONCE,s=c2FsdHNhbHQ=,i=4096";
        let reply_raw = frame(
            902,
            31,
            doc! {
                "conversationId": 1,
                "done": false,
                "payload": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: server_first.as_bytes().to_vec() },
                "ok": 1.0,
            },
        );
        let (reply_header, reply_message) = wire::decode_frame(&reply_raw).unwrap();
        let mock = Mock::new(
            MockKind::Mongo,
            "mongo-auth",
            MockSpec::new(ProtocolPayload::Mongo {
                requests: vec![auth_request],
                responses: vec![MongoResponse {
                    header: reply_header,
                    message: reply_message,
                    read_delay_ns: 0,
                }],
            }),
            0,
        )
        .into_config();
        let store = Arc::new(MockStore::new());
        store.load(vec![mock]).unwrap();

        let (near, mut far) = tokio::io::duplex(16 * 1024);
        let parser = MongoParser;
        let ctx = ctx();
        let opts = Options {
            mongo_password: Some("p@ss".into()),
            ..Default::default()
        };
        let replay = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(near), Bytes::new());
            parser.mock_outgoing(client, None, store, &ctx, &opts).await
        });

        let live_raw = frame(
            31,
            0,
            doc! {
                "saslStart": 1,
                "mechanism": "SCRAM-SHA-256",
                "payload": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: b"n,,n=alice,r=abc".to_vec() },
                "$db": "admin",
            },
        );
        tokio::io::AsyncWriteExt::write_all(&mut far, &live_raw)
            .await
            .unwrap();

        let mut len = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut len)
            .await
            .unwrap();
        let total = LittleEndian::read_i32(&len) as usize;
        let mut rest = vec![0u8; total - 4];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut rest)
            .await
            .unwrap();
        let mut full = len.to_vec();
        full.extend_from_slice(&rest);

        let (_, message) = wire::decode_frame(&full).unwrap();
        let MongoMessage::Msg { sections, .. } = &message else {
            panic!("expected OP_MSG");
        };
        let MongoSection::Body { document } = &sections[0] else {
            panic!("expected body");
        };
        let payload = matching::extract_payload(document).unwrap();
        // Server nonce grafted onto the live client nonce; recorded
        // salt and iteration count preserved.
        assert!(payload.starts_with("r=abcSERVERNONCE"), "payload: {payload}");
        assert!(payload.contains("s=c2FsdHNhbHQ="));
        assert!(payload.contains("i=4096"));

        drop(far);
        replay.await.unwrap().unwrap();
    }
}
