//! Redis record/replay state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::{ParseError, ParseResult};
use shunt_core::matching::{jaccard_similarity, FUZZY_MAX_PAYLOAD};
use shunt_core::mock::{
    self, Mock, MockKind, MockSpec, ProtocolPayload, RespPayload, RespValue, META_CONNECTION_ID,
    META_OPERATION,
};
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::{BoxedStream, ProtocolParser};
use shunt_proxy::peek::PeekedStream;
use shunt_store::{MockEntry, MockStore};

use crate::resp;

/// Fuzzy floor for the filtered partition tier.
const FILTERED_FLOOR: f64 = 0.9;
/// Fuzzy floor for the unfiltered fallback tier.
const TOTAL_FLOOR: f64 = 0.4;

#[derive(Debug, Default)]
pub struct RedisParser;

#[async_trait]
impl ProtocolParser for RedisParser {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn kind(&self) -> MockKind {
        MockKind::Redis
    }

    fn match_type(&self, peeked: &[u8]) -> bool {
        matches!(peeked.first(), Some(b'*' | b'+' | b'-' | b':' | b'$'))
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
        let mut pending: VecDeque<RespValue> = VecDeque::new();

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                n = client.read(&mut client_buf) => {
                    let n = n?;
                    if n == 0 {
                        return Ok(());
                    }
                    dest.write_all(&client_buf[..n]).await?;
                    client_acc.extend_from_slice(&client_buf[..n]);
                    while let Some((value, used)) = resp::parse_value(&client_acc)? {
                        let _ = client_acc.split_to(used);
                        pending.push_back(value);
                    }
                }
                n = dest.read(&mut dest_buf) => {
                    let n = n?;
                    if n == 0 {
                        return Ok(());
                    }
                    client.write_all(&dest_buf[..n]).await?;
                    dest_acc.extend_from_slice(&dest_buf[..n]);
                    while let Some((value, used)) = resp::parse_value(&dest_acc)? {
                        let _ = dest_acc.split_to(used);
                        match pending.pop_front() {
                            Some(request) => emit(sink, ctx, request, value).await,
                            // Unsolicited push (pub/sub); nothing to pair with.
                            None => debug!(conn = %ctx.client_conn_id, "unpaired redis reply"),
                        }
                    }
                }
            }
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
        let mut acc = BytesMut::new();
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            let n = tokio::select! {
                n = client.read(&mut buf) => n?,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            if n == 0 {
                return Ok(());
            }
            acc.extend_from_slice(&buf[..n]);

            while let Some((value, used)) = resp::parse_value(&acc)? {
                let _ = acc.split_to(used);
                let request = RespPayload {
                    message: vec![value],
                };
                let responses = consume_match(&store, &request, opts.fuzzy_enabled)?;
                let mut out = Vec::new();
                for payload in &responses {
                    for value in &payload.message {
                        resp::encode_value(value, &mut out)?;
                    }
                }
                client.write_all(&out).await?;
                client.flush().await?;
            }
        }
    }
}

async fn emit(sink: &MockSink, ctx: &ConnContext, request: RespValue, response: RespValue) {
    let operation = command_name(&request);
    let order = mock::next_sort_order();
    let spec = MockSpec::new(ProtocolPayload::Redis {
        requests: vec![RespPayload {
            message: vec![request],
        }],
        responses: vec![RespPayload {
            message: vec![response],
        }],
    })
    .with_meta(META_OPERATION, operation)
    .with_meta(META_CONNECTION_ID, ctx.client_conn_id.clone());
    sink.send(Mock::new(MockKind::Redis, format!("redis-{order}"), spec, order))
        .await;
}

/// Best-effort command name from a request value, for metadata.
fn command_name(value: &RespValue) -> String {
    use base64::Engine as _;
    if let RespValue::Array { items } = value {
        if let Some(RespValue::Bulk { value_b64 }) = items.first() {
            if let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(value_b64) {
                return String::from_utf8_lossy(&raw).to_ascii_uppercase();
            }
        }
    }
    "RESP".to_string()
}

/// Three-tier match: exact on filtered, fuzzy on filtered, then the
/// same two tiers on unfiltered. Filtered hits are consumed.
fn consume_match(
    store: &MockStore,
    request: &RespPayload,
    fuzzy: bool,
) -> ParseResult<Vec<RespPayload>> {
    let wire = resp::canonical_bytes(std::slice::from_ref(request))?;
    if wire.len() > FUZZY_MAX_PAYLOAD {
        return Err(ParseError::PayloadTooLarge(wire.len()));
    }

    loop {
        let Some((entry, from_filtered)) = find_match(store, &wire, fuzzy) else {
            return Err(ParseError::NoMatch {
                operation: command_name(&request.message[0]),
            });
        };
        let ProtocolPayload::Redis { responses, .. } = &entry.mock.spec.payload else {
            return Err(ParseError::Codec("redis mock holds non-redis payload".into()));
        };
        let responses = responses.clone();

        if from_filtered {
            if !store.delete_filtered(&entry) {
                continue;
            }
        } else if let Err(e) = store.flag_as_used(&entry) {
            warn!("failed to flag redis mock as used: {e}");
        }
        return Ok(responses);
    }
}

fn find_match(store: &MockStore, wire: &[u8], fuzzy: bool) -> Option<(MockEntry, bool)> {
    for (entries, from_filtered, floor) in [
        (store.get_filtered(), true, FILTERED_FLOOR),
        (store.get_unfiltered(), false, TOTAL_FLOOR),
    ] {
        let candidates: Vec<(MockEntry, Vec<u8>)> = entries
            .into_iter()
            .filter(|e| e.mock.kind == MockKind::Redis)
            .filter_map(|e| {
                let ProtocolPayload::Redis { requests, .. } = &e.mock.spec.payload else {
                    return None;
                };
                let bytes = resp::canonical_bytes(requests).ok()?;
                Some((e, bytes))
            })
            .collect();

        if let Some((entry, _)) = candidates.iter().find(|(_, req)| req.as_slice() == wire) {
            return Some((entry.clone(), from_filtered));
        }
        if !fuzzy {
            continue;
        }
        let best = candidates
            .iter()
            .filter_map(|(entry, req)| jaccard_similarity(wire, req).map(|s| (entry, s)))
            .filter(|(_, score)| *score >= floor)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((entry, score)) = best {
            debug!(mock = %entry.mock.name, score, "fuzzy redis match");
            return Some((entry.clone(), from_filtered));
        }
    }
    None
}
