//! The byte-blob record/replay engine shared by the generic and Kafka
//! parsers.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use shunt_core::error::{ParseError, ParseResult};
use shunt_core::matching::{jaccard_similarity, FUZZY_MAX_PAYLOAD};
use shunt_core::mock::{
    self, Mock, MockKind, MockSpec, ProtocolPayload, META_CONNECTION_ID, META_OPERATION,
};
use shunt_core::context::ConnContext;
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::BoxedStream;
use shunt_proxy::peek::PeekedStream;
use shunt_store::{MockEntry, MockStore};

/// Minimum similarity for a fuzzy hit in the filtered partition.
const FILTERED_FLOOR: f64 = 0.9;
/// Minimum similarity for the unfiltered fallback tier.
const TOTAL_FLOOR: f64 = 0.4;

/// Forward bytes in both directions, capturing each side, and emit one
/// opaque mock when the connection closes.
pub async fn record_bytes(
    mut client: PeekedStream,
    mut dest: BoxedStream,
    kind: MockKind,
    ctx: &ConnContext,
    sink: &MockSink,
) -> ParseResult<()> {
    let mut request = Vec::new();
    let mut response = Vec::new();
    let mut client_buf = vec![0u8; 16 * 1024];
    let mut dest_buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(conn = %ctx.client_conn_id, "byte record cancelled");
                return Ok(());
            }
            n = client.read(&mut client_buf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                dest.write_all(&client_buf[..n]).await?;
                request.extend_from_slice(&client_buf[..n]);
            }
            n = dest.read(&mut dest_buf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                client.write_all(&dest_buf[..n]).await?;
                response.extend_from_slice(&dest_buf[..n]);
            }
        }
    }

    if request.is_empty() || response.is_empty() {
        debug!(conn = %ctx.client_conn_id, "one-sided byte exchange, nothing to record");
        return Ok(());
    }

    let order = mock::next_sort_order();
    let spec = MockSpec::new(ProtocolPayload::Generic {
        request_b64: B64.encode(&request),
        response_b64: B64.encode(&response),
    })
    .with_meta(META_OPERATION, kind.as_str().to_ascii_lowercase())
    .with_meta(META_CONNECTION_ID, ctx.client_conn_id.clone());
    let name = format!("{}-{order}", kind.as_str().to_ascii_lowercase());
    sink.send(Mock::new(kind, name, spec, order)).await;
    Ok(())
}

/// Serve the client from stored byte blobs until it closes.
pub async fn replay_bytes(
    mut client: PeekedStream,
    kind: MockKind,
    store: Arc<MockStore>,
    ctx: &ConnContext,
    opts: &Options,
) -> ParseResult<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = tokio::select! {
            n = client.read(&mut buf) => n?,
            _ = ctx.cancel.cancelled() => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        let request = &buf[..n];
        if request.len() > FUZZY_MAX_PAYLOAD {
            return Err(ParseError::PayloadTooLarge(request.len()));
        }

        let response = consume_match(&store, kind, request, opts.fuzzy_enabled)?;
        client.write_all(&response).await?;
        client.flush().await?;
    }
}

/// Match, consume (for filtered hits) and return the stored response
/// bytes, retrying the scan when a concurrent consumer wins the CAS.
fn consume_match(
    store: &MockStore,
    kind: MockKind,
    request: &[u8],
    fuzzy: bool,
) -> ParseResult<Vec<u8>> {
    loop {
        let Some((entry, from_filtered)) = find_match(store, kind, request, fuzzy) else {
            return Err(ParseError::NoMatch {
                operation: kind.as_str().to_ascii_lowercase(),
            });
        };
        let response = decode_blob(&entry)
            .map(|(_, resp)| resp)
            .ok_or_else(|| ParseError::Codec("stored blob is not valid base64".into()))?;

        if from_filtered {
            if !store.delete_filtered(&entry) {
                // Lost the race; re-read and re-match.
                continue;
            }
        } else if let Err(e) = store.flag_as_used(&entry) {
            warn!("failed to flag mock as used: {e}");
        }
        return Ok(response);
    }
}

fn find_match(
    store: &MockStore,
    kind: MockKind,
    request: &[u8],
    fuzzy: bool,
) -> Option<(MockEntry, bool)> {
    for (entries, from_filtered, floor) in [
        (store.get_filtered(), true, FILTERED_FLOOR),
        (store.get_unfiltered(), false, TOTAL_FLOOR),
    ] {
        let candidates: Vec<(MockEntry, Vec<u8>)> = entries
            .into_iter()
            .filter(|e| e.mock.kind == kind)
            .filter_map(|e| decode_blob(&e).map(|(req, _)| (e, req)))
            .collect();

        // Exact tier first.
        if let Some((entry, _)) = candidates.iter().find(|(_, req)| req.as_slice() == request) {
            return Some((entry.clone(), from_filtered));
        }

        if !fuzzy {
            continue;
        }
        let best = candidates
            .iter()
            .filter_map(|(entry, req)| {
                jaccard_similarity(request, req).map(|score| (entry, score))
            })
            .filter(|(_, score)| *score >= floor)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((entry, score)) = best {
            debug!(mock = %entry.mock.name, score, "fuzzy byte match");
            return Some((entry.clone(), from_filtered));
        }
    }
    None
}

fn decode_blob(entry: &MockEntry) -> Option<(Vec<u8>, Vec<u8>)> {
    match &entry.mock.spec.payload {
        ProtocolPayload::Generic {
            request_b64,
            response_b64,
        } => {
            let req = B64.decode(request_b64).ok()?;
            let resp = B64.decode(response_b64).ok()?;
            Some((req, resp))
        }
        _ => None,
    }
}
