//! PostgreSQL record/replay state machine.
//!
//! Record mode tracks both directions of a session: client frames
//! accumulate into the current request burst, server frames into the
//! response burst, and a `ReadyForQuery` from the server closes the
//! exchange and emits a mock. The first exchange of a connection covers
//! the startup handshake and is stored as reusable config.
//!
//! Replay mode answers the SSL probe itself, drives the recorded
//! startup conversation from the unfiltered partition, then serves
//! query bursts from the filtered partition in `sort_order`.

use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::{ParseError, ParseResult};
use shunt_core::matching::jaccard_similarity;
use shunt_core::mock::{
    self, Mock, MockKind, MockSpec, PgDecoded, PgFrame, ProtocolPayload, META_CONNECTION_ID,
    META_OPERATION,
};
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::{BoxedStream, ProtocolParser};
use shunt_proxy::peek::PeekedStream;
use shunt_store::{MockEntry, MockStore};

use crate::wire;

/// Fuzzy floor when no burst matches structurally.
const FUZZY_FLOOR: f64 = 0.9;

#[derive(Debug, Default)]
pub struct PostgresParser;

#[async_trait]
impl ProtocolParser for PostgresParser {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn kind(&self) -> MockKind {
        MockKind::Postgres
    }

    fn match_type(&self, peeked: &[u8]) -> bool {
        if peeked.len() < 8 {
            return false;
        }
        let length = BigEndian::read_u32(&peeked[0..4]);
        let code = BigEndian::read_u32(&peeked[4..8]);
        if !(8..=10_000).contains(&length) {
            return false;
        }
        matches!(
            code,
            wire::PROTOCOL_V3
                | wire::SSL_REQUEST_CODE
                | wire::CANCEL_REQUEST_CODE
                | wire::GSSENC_REQUEST_CODE
        )
    }

    async fn record_outgoing(
        &self,
        mut client: PeekedStream,
        mut dest: BoxedStream,
        ctx: &ConnContext,
        sink: &MockSink,
        _opts: &Options,
    ) -> ParseResult<()> {
        let mut client_acc = BytesMut::new();
        let mut dest_acc = BytesMut::new();
        let mut client_buf = vec![0u8; 16 * 1024];
        let mut dest_buf = vec![0u8; 16 * 1024];

        let mut startup_done = false;
        let mut awaiting_probe_answer = false;
        let mut requests: Vec<PgFrame> = Vec::new();
        let mut responses: Vec<PgFrame> = Vec::new();
        let mut first_exchange = true;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                n = client.read(&mut client_buf) => {
                    let n = n?;
                    if n == 0 {
                        break;
                    }
                    dest.write_all(&client_buf[..n]).await?;
                    client_acc.extend_from_slice(&client_buf[..n]);

                    loop {
                        if startup_done {
                            let Some(frame) = wire::take_typed_frame(&mut client_acc)? else {
                                break;
                            };
                            requests.push(wire::decode_frontend(&frame));
                        } else {
                            let Some(frame) = wire::take_startup_frame(&mut client_acc)? else {
                                break;
                            };
                            let decoded = wire::decode_startup(&frame);
                            match &decoded.decoded {
                                PgDecoded::SslRequest | PgDecoded::Opaque => {
                                    awaiting_probe_answer = true;
                                }
                                PgDecoded::Startup { .. } => startup_done = true,
                                _ => {}
                            }
                            requests.push(decoded);
                        }
                    }
                }
                n = dest.read(&mut dest_buf) => {
                    let n = n?;
                    if n == 0 {
                        break;
                    }
                    client.write_all(&dest_buf[..n]).await?;
                    dest_acc.extend_from_slice(&dest_buf[..n]);

                    if awaiting_probe_answer && !dest_acc.is_empty() {
                        let answer = dest_acc.split_to(1)[0];
                        awaiting_probe_answer = false;
                        responses.push(probe_answer_frame(answer));
                        if answer == b'S' {
                            warn!(
                                conn = %ctx.client_conn_id,
                                "postgres destination negotiated tls, continuing opaque"
                            );
                            // Cannot decode an encrypted session; keep
                            // forwarding verbatim without recording.
                            tokio::io::copy_bidirectional(&mut client, &mut dest).await.ok();
                            return Ok(());
                        }
                    }

                    while let Some(frame) = wire::take_typed_frame(&mut dest_acc)? {
                        let is_ready = frame[0] == b'Z';
                        responses.push(wire::decode_backend(&frame));
                        if is_ready {
                            emit(sink, ctx, &mut requests, &mut responses, &mut first_exchange)
                                .await;
                        }
                    }
                }
            }
        }

        if !requests.is_empty() && !responses.is_empty() {
            emit(sink, ctx, &mut requests, &mut responses, &mut first_exchange).await;
        }
        Ok(())
    }

    async fn mock_outgoing(
        &self,
        mut client: PeekedStream,
        _dst: Option<&ConditionalDstCfg>,
        store: Arc<MockStore>,
        ctx: &ConnContext,
        opts: &Options,
    ) -> ParseResult<()> {
        let mut acc = BytesMut::new();

        // ── Startup phase ──────────────────────────────────────────
        let startup = loop {
            let Some(frame) = wire::take_startup_frame(&mut acc)? else {
                if fill(&mut client, &mut acc, ctx).await? == 0 {
                    return Ok(());
                }
                continue;
            };
            let decoded = wire::decode_startup(&frame);
            match &decoded.decoded {
                PgDecoded::SslRequest | PgDecoded::Opaque => {
                    // We terminate the session ourselves, in the clear.
                    client.write_all(b"N").await?;
                    client.flush().await?;
                }
                PgDecoded::CancelRequest => return Ok(()),
                _ => break decoded,
            }
        };
        serve_startup(&mut client, &store, &startup, &mut acc, ctx).await?;

        // ── Query bursts ───────────────────────────────────────────
        let mut burst: Vec<PgFrame> = Vec::new();
        loop {
            let Some(frame) = wire::take_typed_frame(&mut acc)? else {
                if fill(&mut client, &mut acc, ctx).await? == 0 {
                    return Ok(());
                }
                continue;
            };
            let tag = frame[0];
            if tag == b'X' {
                debug!(conn = %ctx.client_conn_id, "postgres client terminated");
                return Ok(());
            }
            burst.push(wire::decode_frontend(&frame));
            if matches!(tag, b'Q' | b'S' | b'H' | b'p') {
                serve_burst(&mut client, &store, &mut burst, opts).await?;
            }
        }
    }
}

async fn fill(
    client: &mut PeekedStream,
    acc: &mut BytesMut,
    ctx: &ConnContext,
) -> ParseResult<usize> {
    let mut buf = vec![0u8; 16 * 1024];
    let n = tokio::select! {
        n = client.read(&mut buf) => n?,
        _ = ctx.cancel.cancelled() => return Ok(0),
    };
    acc.extend_from_slice(&buf[..n]);
    Ok(n)
}

fn probe_answer_frame(answer: u8) -> PgFrame {
    use base64::Engine as _;
    PgFrame {
        tag: answer as char,
        raw_b64: base64::engine::general_purpose::STANDARD.encode([answer]),
        decoded: PgDecoded::Opaque,
    }
}

async fn emit(
    sink: &MockSink,
    ctx: &ConnContext,
    requests: &mut Vec<PgFrame>,
    responses: &mut Vec<PgFrame>,
    first_exchange: &mut bool,
) {
    if requests.is_empty() || responses.is_empty() {
        return;
    }
    let operation = if *first_exchange {
        "startup".to_string()
    } else {
        requests.iter().map(|f| f.tag).collect()
    };
    let order = mock::next_sort_order();
    let spec = MockSpec::new(ProtocolPayload::Postgres {
        requests: std::mem::take(requests),
        responses: std::mem::take(responses),
    })
    .with_meta(META_OPERATION, operation)
    .with_meta(META_CONNECTION_ID, ctx.client_conn_id.clone());
    let mut mock = Mock::new(MockKind::Postgres, format!("postgres-{order}"), spec, order);
    if *first_exchange {
        mock = mock.into_config();
        *first_exchange = false;
    }
    sink.send(mock).await;
}

/// Replay the recorded startup conversation: find the unfiltered mock
/// whose startup packet matches, then write its response frames,
/// pausing at authentication challenges to consume the client's answer.
async fn serve_startup(
    client: &mut PeekedStream,
    store: &MockStore,
    startup: &PgFrame,
    acc: &mut BytesMut,
    ctx: &ConnContext,
) -> ParseResult<()> {
    let entry = find_startup_mock(store, startup).ok_or_else(|| ParseError::NoMatch {
        operation: "postgres startup".into(),
    })?;
    let ProtocolPayload::Postgres { responses, .. } = &entry.mock.spec.payload else {
        return Err(ParseError::Codec("postgres mock holds foreign payload".into()));
    };

    for frame in responses {
        // Probe answers were recorded as raw single bytes; the replayed
        // session already answered the probe itself.
        if frame.tag == 'N' && frame.decoded == PgDecoded::Opaque && frame.raw_b64.len() <= 4 {
            continue;
        }
        client.write_all(&wire::wire_bytes(frame)?).await?;
        client.flush().await?;

        if matches!(
            frame.decoded,
            PgDecoded::Authentication {
                code: 3 | 5 | 10 | 11
            }
        ) {
            // The client owes us an answer before the conversation
            // continues; consume one frame.
            loop {
                match wire::take_typed_frame(acc)? {
                    Some(answer) => {
                        debug!(tag = %(answer[0] as char), "consumed auth answer");
                        break;
                    }
                    None => {
                        if fill(client, acc, ctx).await? == 0 {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    if let Err(e) = store.flag_as_used(&entry) {
        warn!("failed to flag startup mock as used: {e}");
    }
    Ok(())
}

fn find_startup_mock(store: &MockStore, startup: &PgFrame) -> Option<MockEntry> {
    let candidates = store.get_unfiltered();
    let mut fallback = None;
    for entry in candidates {
        if entry.mock.kind != MockKind::Postgres {
            continue;
        }
        let ProtocolPayload::Postgres { requests, .. } = &entry.mock.spec.payload else {
            continue;
        };
        let Some(recorded) = requests
            .iter()
            .find(|f| matches!(f.decoded, PgDecoded::Startup { .. }))
        else {
            continue;
        };
        if recorded.decoded == startup.decoded {
            return Some(entry);
        }
        // Same-version startup with different parameters still beats
        // nothing; parameters differ across test environments.
        fallback.get_or_insert(entry);
    }
    fallback
}

/// Serve one client burst from the store, consuming the matched mock.
async fn serve_burst(
    client: &mut PeekedStream,
    store: &MockStore,
    burst: &mut Vec<PgFrame>,
    opts: &Options,
) -> ParseResult<()> {
    let request = std::mem::take(burst);
    loop {
        let Some((entry, from_filtered)) = find_burst_mock(store, &request, opts) else {
            return Err(ParseError::NoMatch {
                operation: request.iter().map(|f| f.tag).collect(),
            });
        };
        let ProtocolPayload::Postgres { responses, .. } = &entry.mock.spec.payload else {
            return Err(ParseError::Codec("postgres mock holds foreign payload".into()));
        };
        let mut out = Vec::new();
        for frame in responses {
            out.extend_from_slice(&wire::wire_bytes(frame)?);
        }

        if from_filtered {
            if !store.delete_filtered(&entry) {
                continue;
            }
        } else if let Err(e) = store.flag_as_used(&entry) {
            warn!("failed to flag postgres mock as used: {e}");
        }
        client.write_all(&out).await?;
        client.flush().await?;
        return Ok(());
    }
}

fn find_burst_mock(
    store: &MockStore,
    burst: &[PgFrame],
    opts: &Options,
) -> Option<(MockEntry, bool)> {
    for (entries, from_filtered) in [(store.get_filtered(), true), (store.get_unfiltered(), false)]
    {
        let candidates: Vec<(MockEntry, Vec<PgFrame>)> = entries
            .into_iter()
            .filter(|e| e.mock.kind == MockKind::Postgres)
            .filter_map(|e| {
                let ProtocolPayload::Postgres { requests, .. } = &e.mock.spec.payload else {
                    return None;
                };
                let requests = requests.clone();
                Some((e, requests))
            })
            .collect();

        // Structural tier: same frame sequence, same decoded fields.
        if let Some((entry, _)) = candidates
            .iter()
            .find(|(_, requests)| bursts_equal(requests, burst))
        {
            return Some((entry.clone(), from_filtered));
        }

        if !opts.fuzzy_enabled {
            continue;
        }
        let burst_raw = concat_raw(burst);
        let best = candidates
            .iter()
            .filter_map(|(entry, requests)| {
                let raw = concat_raw(requests);
                jaccard_similarity(&burst_raw, &raw).map(|score| (entry, score))
            })
            .filter(|(_, score)| *score >= FUZZY_FLOOR)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((entry, score)) = best {
            debug!(mock = %entry.mock.name, score, "fuzzy postgres match");
            return Some((entry.clone(), from_filtered));
        }
    }
    None
}

/// Structural equality of two bursts. Password messages compare by tag
/// only; credentials legitimately differ between record and replay.
fn bursts_equal(recorded: &[PgFrame], burst: &[PgFrame]) -> bool {
    if recorded.len() != burst.len() {
        return false;
    }
    recorded.iter().zip(burst).all(|(a, b)| {
        a.tag == b.tag
            && (a.decoded == b.decoded
                || matches!(a.decoded, PgDecoded::PasswordMessage))
    })
}

fn concat_raw(frames: &[PgFrame]) -> Vec<u8> {
    frames
        .iter()
        .filter_map(|f| wire::wire_bytes(f).ok())
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use crate::wire::build_typed_frame;

    fn ctx() -> ConnContext {
        ConnContext::new("127.0.0.1", CancellationToken::new())
    }

    fn startup_frame() -> Vec<u8> {
        let mut body = Vec::new();
        let mut ver = [0u8; 4];
        BigEndian::write_u32(&mut ver, wire::PROTOCOL_V3);
        body.extend_from_slice(&ver);
        body.extend_from_slice(b"user\0alice\0database\0orders\0\0");
        let mut frame = Vec::new();
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, (body.len() + 4) as u32);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(&body);
        frame
    }

    fn config_mock() -> Mock {
        let requests = vec![wire::decode_startup(&startup_frame())];
        let responses = vec![
            wire::decode_backend(&build_typed_frame(b'R', &[0, 0, 0, 0])),
            wire::decode_backend(&build_typed_frame(b'Z', b"I")),
        ];
        Mock::new(
            MockKind::Postgres,
            "postgres-0",
            MockSpec::new(ProtocolPayload::Postgres {
                requests,
                responses,
            }),
            0,
        )
        .into_config()
    }

    fn pipeline_mock(order: i64) -> Mock {
        // P(prep1) B E B E S  →  1 2 D C 2 D C Z
        let requests = vec![
            wire::decode_frontend(&build_typed_frame(
                b'P',
                b"prep1\0SELECT name FROM t WHERE id=$1\0\x00\x00",
            )),
            wire::decode_frontend(&build_typed_frame(
                b'B',
                b"\0prep1\0\x00\x00\x00\x01\x00\x00\x00\x011\x00\x00",
            )),
            wire::decode_frontend(&build_typed_frame(b'E', b"\0\x00\x00\x00\x00")),
            wire::decode_frontend(&build_typed_frame(
                b'B',
                b"\0prep1\0\x00\x00\x00\x01\x00\x00\x00\x011\x00\x00",
            )),
            wire::decode_frontend(&build_typed_frame(b'E', b"\0\x00\x00\x00\x00")),
            wire::decode_frontend(&build_typed_frame(b'S', b"")),
        ];
        let data_a = {
            let mut body = vec![0, 1];
            body.extend_from_slice(&[0, 0, 0, 1]);
            body.push(b'a');
            body
        };
        let data_b = {
            let mut body = vec![0, 1];
            body.extend_from_slice(&[0, 0, 0, 1]);
            body.push(b'b');
            body
        };
        let responses = vec![
            wire::decode_backend(&build_typed_frame(b'1', b"")),
            wire::decode_backend(&build_typed_frame(b'2', b"")),
            wire::decode_backend(&build_typed_frame(b'D', &data_a)),
            wire::decode_backend(&build_typed_frame(b'C', b"SELECT 1\0")),
            wire::decode_backend(&build_typed_frame(b'2', b"")),
            wire::decode_backend(&build_typed_frame(b'D', &data_b)),
            wire::decode_backend(&build_typed_frame(b'C', b"SELECT 1\0")),
            wire::decode_backend(&build_typed_frame(b'Z', b"I")),
        ];
        Mock::new(
            MockKind::Postgres,
            format!("postgres-{order}"),
            MockSpec::new(ProtocolPayload::Postgres {
                requests,
                responses,
            }),
            order,
        )
    }

    #[tokio::test]
    async fn replay_answers_ssl_probe_and_startup() {
        let store = Arc::new(MockStore::new());
        store.load(vec![config_mock()]).unwrap();

        let (near, mut far) = tokio::io::duplex(4096);
        let parser = PostgresParser;
        let ctx = ctx();
        let store_clone = Arc::clone(&store);
        let replay = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(near), Bytes::new());
            parser
                .mock_outgoing(client, None, store_clone, &ctx, &Options::default())
                .await
        });

        // SSL probe answered 'N' by the proxy itself.
        let mut probe = vec![0, 0, 0, 8];
        let mut code = [0u8; 4];
        BigEndian::write_u32(&mut code, wire::SSL_REQUEST_CODE);
        probe.extend_from_slice(&code);
        tokio::io::AsyncWriteExt::write_all(&mut far, &probe)
            .await
            .unwrap();
        let mut answer = [0u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut answer)
            .await
            .unwrap();
        assert_eq!(&answer, b"N");

        // Startup is served from the config mock: R(ok) + Z.
        tokio::io::AsyncWriteExt::write_all(&mut far, &startup_frame())
            .await
            .unwrap();
        let mut auth = vec![0u8; 9];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut auth)
            .await
            .unwrap();
        assert_eq!(auth[0], b'R');
        let mut ready = vec![0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut ready)
            .await
            .unwrap();
        assert_eq!(ready[0], b'Z');

        // Config mock is never consumed.
        assert_eq!(store.unfiltered_len(), 1);

        drop(far);
        replay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replay_pipelined_burst_in_recorded_order() {
        let store = Arc::new(MockStore::new());
        store.load(vec![config_mock(), pipeline_mock(1)]).unwrap();

        let (near, mut far) = tokio::io::duplex(8192);
        let parser = PostgresParser;
        let ctx = ctx();
        let store_clone = Arc::clone(&store);
        let replay = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(near), Bytes::new());
            parser
                .mock_outgoing(client, None, store_clone, &ctx, &Options::default())
                .await
        });

        tokio::io::AsyncWriteExt::write_all(&mut far, &startup_frame())
            .await
            .unwrap();
        let mut startup_reply = vec![0u8; 9 + 6];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut startup_reply)
            .await
            .unwrap();

        // Send the pipelined extended-query burst exactly as recorded.
        let mut burst = Vec::new();
        burst.extend_from_slice(&build_typed_frame(
            b'P',
            b"prep1\0SELECT name FROM t WHERE id=$1\0\x00\x00",
        ));
        burst.extend_from_slice(&build_typed_frame(
            b'B',
            b"\0prep1\0\x00\x00\x00\x01\x00\x00\x00\x011\x00\x00",
        ));
        burst.extend_from_slice(&build_typed_frame(b'E', b"\0\x00\x00\x00\x00"));
        burst.extend_from_slice(&build_typed_frame(
            b'B',
            b"\0prep1\0\x00\x00\x00\x01\x00\x00\x00\x011\x00\x00",
        ));
        burst.extend_from_slice(&build_typed_frame(b'E', b"\0\x00\x00\x00\x00"));
        burst.extend_from_slice(&build_typed_frame(b'S', b""));
        tokio::io::AsyncWriteExt::write_all(&mut far, &burst)
            .await
            .unwrap();

        // The response frames come back in recorded order.
        let expected_tags = [b'1', b'2', b'D', b'C', b'2', b'D', b'C', b'Z'];
        for expected in expected_tags {
            let mut head = [0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut far, &mut head)
                .await
                .unwrap();
            assert_eq!(head[0], expected, "tag {}", expected as char);
            let len = BigEndian::read_u32(&head[1..5]) as usize;
            let mut body = vec![0u8; len - 4];
            tokio::io::AsyncReadExt::read_exact(&mut far, &mut body)
                .await
                .unwrap();
        }

        // The burst consumed the filtered mock.
        assert_eq!(store.filtered_len(), 0);

        drop(far);
        replay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn record_splits_exchanges_at_ready_for_query() {
        let (client_near, mut client_far) = tokio::io::duplex(8192);
        let (dest_near, mut dest_far) = tokio::io::duplex(8192);
        let (sink, mut rx) = MockSink::channel(8);

        let parser = PostgresParser;
        let ctx = ctx();
        let record = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(client_near), Bytes::new());
            parser
                .record_outgoing(client, Box::new(dest_near), &ctx, &sink, &Options::default())
                .await
        });

        // Startup → auth ok + ready.
        tokio::io::AsyncWriteExt::write_all(&mut client_far, &startup_frame())
            .await
            .unwrap();
        let mut fwd = vec![0u8; startup_frame().len()];
        tokio::io::AsyncReadExt::read_exact(&mut dest_far, &mut fwd)
            .await
            .unwrap();
        let mut reply = Vec::new();
        reply.extend_from_slice(&build_typed_frame(b'R', &[0, 0, 0, 0]));
        reply.extend_from_slice(&build_typed_frame(b'Z', b"I"));
        tokio::io::AsyncWriteExt::write_all(&mut dest_far, &reply)
            .await
            .unwrap();
        let mut back = vec![0u8; reply.len()];
        tokio::io::AsyncReadExt::read_exact(&mut client_far, &mut back)
            .await
            .unwrap();

        let config = rx.recv().await.unwrap();
        assert!(config.is_config());
        assert!(!config.test_mode_info.is_filtered);

        // Simple query → rows + ready.
        let query = build_typed_frame(b'Q', b"SELECT 1\0");
        tokio::io::AsyncWriteExt::write_all(&mut client_far, &query)
            .await
            .unwrap();
        let mut fwd = vec![0u8; query.len()];
        tokio::io::AsyncReadExt::read_exact(&mut dest_far, &mut fwd)
            .await
            .unwrap();
        let mut reply = Vec::new();
        reply.extend_from_slice(&build_typed_frame(b'C', b"SELECT 1\0"));
        reply.extend_from_slice(&build_typed_frame(b'Z', b"I"));
        tokio::io::AsyncWriteExt::write_all(&mut dest_far, &reply)
            .await
            .unwrap();
        let mut back = vec![0u8; reply.len()];
        tokio::io::AsyncReadExt::read_exact(&mut client_far, &mut back)
            .await
            .unwrap();

        let mock = rx.recv().await.unwrap();
        assert!(!mock.is_config());
        assert!(mock.test_mode_info.is_filtered);
        let ProtocolPayload::Postgres { requests, responses } = &mock.spec.payload else {
            panic!("expected postgres payload");
        };
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tag, 'Q');
        assert_eq!(responses.last().unwrap().tag, 'Z');

        drop(client_far);
        drop(dest_far);
        record.await.unwrap().unwrap();
    }
}
