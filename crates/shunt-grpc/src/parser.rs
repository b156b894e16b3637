//! gRPC-over-HTTP/2 record/replay.
//!
//! The parser terminates HTTP/2 toward the client and, in record mode,
//! opens one multiplexed HTTP/2 connection toward the destination that
//! every stream handler shares. Message frames pass through untouched
//! (no protobuf parsing); each completed stream becomes one mock.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::{ParseError, ParseResult};
use shunt_core::mock::{
    self, GrpcReq, GrpcResp, Mock, MockKind, MockSpec, ProtocolPayload, META_CONNECTION_ID,
    META_OPERATION,
};
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::{BoxedStream, ProtocolParser};
use shunt_proxy::peek::PeekedStream;
use shunt_store::{MockEntry, MockStore};

use crate::headers;

/// The HTTP/2 connection preface the detector looks for.
const H2_PREFACE: &[u8] = b"PRI * HTTP/2";

fn h2_err(e: h2::Error) -> ParseError {
    ParseError::Codec(format!("h2: {e}"))
}

#[derive(Debug, Default)]
pub struct GrpcParser;

#[async_trait]
impl ProtocolParser for GrpcParser {
    fn name(&self) -> &'static str {
        "grpc"
    }

    fn kind(&self) -> MockKind {
        MockKind::Grpc
    }

    fn match_type(&self, peeked: &[u8]) -> bool {
        peeked.starts_with(H2_PREFACE)
            || (peeked.len() < H2_PREFACE.len() && H2_PREFACE.starts_with(peeked) && !peeked.is_empty())
    }

    async fn record_outgoing(
        &self,
        client: PeekedStream,
        dest: BoxedStream,
        ctx: &ConnContext,
        sink: &MockSink,
        opts: &Options,
    ) -> ParseResult<()> {
        let mut builder = h2::server::Builder::new();
        if let Some(max) = opts.max_grpc_streams {
            builder.max_concurrent_streams(max);
        }
        // The preface bytes re-present through the peek wrapper.
        let mut conn = builder.handshake(client).await.map_err(h2_err)?;
        let shared = Arc::new(SharedDest::new(dest));

        loop {
            let accepted = tokio::select! {
                a = conn.accept() => a,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let Some(stream) = accepted else {
                return Ok(());
            };
            let (request, respond) = stream.map_err(h2_err)?;
            let shared = Arc::clone(&shared);
            let sink = sink.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = record_stream(request, respond, shared, &sink, &ctx).await {
                    if !e.is_benign() {
                        warn!(conn = %ctx.client_conn_id, "grpc record stream failed: {e}");
                    }
                }
            });
        }
    }

    async fn mock_outgoing(
        &self,
        client: PeekedStream,
        _dst: Option<&ConditionalDstCfg>,
        store: Arc<MockStore>,
        ctx: &ConnContext,
        opts: &Options,
    ) -> ParseResult<()> {
        let mut builder = h2::server::Builder::new();
        if let Some(max) = opts.max_grpc_streams {
            builder.max_concurrent_streams(max);
        }
        let mut conn = builder.handshake(client).await.map_err(h2_err)?;

        loop {
            let accepted = tokio::select! {
                a = conn.accept() => a,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let Some(stream) = accepted else {
                return Ok(());
            };
            let (request, respond) = stream.map_err(h2_err)?;
            let store = Arc::clone(&store);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = replay_stream(request, respond, store).await {
                    if !e.is_benign() {
                        warn!(conn = %ctx.client_conn_id, "grpc replay stream failed: {e}");
                    }
                }
            });
        }
    }
}

/// The lazily-created destination connection shared by stream handlers.
///
/// The mutex covers creation and the state probe; the h2 library
/// handles concurrent frame reads and writes internally once the
/// `SendRequest` handles are cloned out.
struct SharedDest {
    state: Mutex<DestState>,
}

enum DestState {
    Idle(BoxedStream),
    Ready(SendRequest<Bytes>),
    Failed,
}

impl SharedDest {
    fn new(dest: BoxedStream) -> Self {
        Self {
            state: Mutex::new(DestState::Idle(dest)),
        }
    }

    async fn acquire(&self) -> ParseResult<SendRequest<Bytes>> {
        let mut guard = self.state.lock().await;
        match std::mem::replace(&mut *guard, DestState::Failed) {
            DestState::Ready(send_request) => {
                *guard = DestState::Ready(send_request.clone());
                Ok(send_request)
            }
            DestState::Idle(io) => match h2::client::handshake(io).await {
                Ok((send_request, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            debug!("grpc destination connection closed: {e}");
                        }
                    });
                    *guard = DestState::Ready(send_request.clone());
                    Ok(send_request)
                }
                Err(e) => Err(h2_err(e)),
            },
            DestState::Failed => Err(ParseError::Codec(
                "grpc destination connection unavailable".into(),
            )),
        }
    }
}

/// Send a buffer respecting h2 flow control.
async fn send_all(tx: &mut SendStream<Bytes>, mut data: Bytes) -> ParseResult<()> {
    while !data.is_empty() {
        tx.reserve_capacity(data.len());
        let granted = std::future::poll_fn(|cx| tx.poll_capacity(cx))
            .await
            .ok_or_else(|| ParseError::Codec("h2 stream closed while sending".into()))?
            .map_err(h2_err)?;
        let chunk = data.split_to(granted.min(data.len()));
        tx.send_data(chunk, false).map_err(h2_err)?;
    }
    Ok(())
}

async fn record_stream(
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    shared: Arc<SharedDest>,
    sink: &MockSink,
    ctx: &ConnContext,
) -> ParseResult<()> {
    let (parts, mut client_body) = request.into_parts();
    let req_headers = headers::capture_request(&parts);

    // Reuse (or lazily create) the multiplexed destination connection,
    // probing its state before each use.
    let send_request = shared.acquire().await?;
    let mut send_request = send_request.ready().await.map_err(h2_err)?;

    let uri = ensure_absolute(parts.uri.clone())?;
    let mut outbound = http::Request::builder().method(parts.method.clone()).uri(uri);
    for (name, value) in parts.headers.iter() {
        if headers::is_connection_header(name.as_str()) || name.as_str() == "te" {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    outbound = outbound.header("te", "trailers");
    let outbound = outbound
        .body(())
        .map_err(|e| ParseError::Codec(format!("outbound request build: {e}")))?;

    let (response_fut, mut dest_tx) = send_request.send_request(outbound, false).map_err(h2_err)?;

    // Client request frames pass through; the bodies concatenate into
    // the recorded buffer.
    let mut req_buf = Vec::new();
    while let Some(chunk) = client_body.data().await {
        let chunk = chunk.map_err(h2_err)?;
        let _ = client_body.flow_control().release_capacity(chunk.len());
        req_buf.extend_from_slice(&chunk);
        send_all(&mut dest_tx, chunk).await?;
    }
    dest_tx.send_data(Bytes::new(), true).map_err(h2_err)?;

    let response = response_fut.await.map_err(h2_err)?;
    let (resp_parts, mut dest_body) = response.into_parts();
    let resp_headers = headers::capture_response(resp_parts.status, &resp_parts.headers);

    let mut client_resp = http::Response::builder().status(resp_parts.status);
    for (name, value) in resp_parts.headers.iter() {
        if headers::is_connection_header(name.as_str()) {
            continue;
        }
        client_resp = client_resp.header(name, value);
    }
    let client_resp = client_resp
        .body(())
        .map_err(|e| ParseError::Codec(format!("client response build: {e}")))?;
    let mut client_tx = respond.send_response(client_resp, false).map_err(h2_err)?;

    let mut resp_buf = Vec::new();
    while let Some(chunk) = dest_body.data().await {
        let chunk = chunk.map_err(h2_err)?;
        let _ = dest_body.flow_control().release_capacity(chunk.len());
        resp_buf.extend_from_slice(&chunk);
        send_all(&mut client_tx, chunk).await?;
    }

    // Trailers-only error responses surface grpc-status in HEADERS.
    let dest_trailers = dest_body.trailers().await.map_err(h2_err)?;
    let mut trailers = headers::capture_trailers(dest_trailers.as_ref());
    if dest_trailers.is_none() {
        for key in ["grpc-status", "grpc-message"] {
            if let Some(value) = resp_parts.headers.get(key) {
                trailers.ordinary.insert(
                    key.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
            }
        }
    }
    client_tx
        .send_trailers(headers::to_header_map(&trailers.ordinary))
        .map_err(h2_err)?;

    let operation = req_headers
        .pseudo
        .get(":path")
        .cloned()
        .unwrap_or_default();
    let order = mock::next_sort_order();
    let spec = MockSpec::new(ProtocolPayload::Grpc {
        req: GrpcReq {
            headers: req_headers,
            body: headers::decode_body(&req_buf),
        },
        resp: GrpcResp {
            headers: resp_headers,
            body: headers::decode_body(&resp_buf),
            trailers,
        },
    })
    .with_meta(META_OPERATION, operation)
    .with_meta(META_CONNECTION_ID, ctx.client_conn_id.clone());
    sink.send(Mock::new(MockKind::Grpc, format!("grpc-{order}"), spec, order))
        .await;
    Ok(())
}

async fn replay_stream(
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    store: Arc<MockStore>,
) -> ParseResult<()> {
    let (parts, mut client_body) = request.into_parts();
    let live = GrpcReq {
        headers: headers::capture_request(&parts),
        body: {
            let mut buf = Vec::new();
            while let Some(chunk) = client_body.data().await {
                let chunk = chunk.map_err(h2_err)?;
                let _ = client_body.flow_control().release_capacity(chunk.len());
                buf.extend_from_slice(&chunk);
            }
            headers::decode_body(&buf)
        },
    };

    let resp = consume_match(&store, &live)?;

    let status = resp
        .headers
        .pseudo
        .get(":status")
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(200);
    let mut response = http::Response::builder().status(status);
    for (name, value) in &resp.headers.ordinary {
        response = response.header(name.as_str(), value.as_str());
    }
    let response = response
        .body(())
        .map_err(|e| ParseError::Codec(format!("replay response build: {e}")))?;
    let mut tx = respond.send_response(response, false).map_err(h2_err)?;

    send_all(&mut tx, Bytes::from(headers::encode_body(&resp.body)?)).await?;

    let mut trailers = resp.trailers.ordinary.clone();
    trailers
        .entry("grpc-status".to_string())
        .or_insert_with(|| "0".to_string());
    trailers
        .entry("grpc-message".to_string())
        .or_insert_with(String::new);
    tx.send_trailers(headers::to_header_map(&trailers))
        .map_err(h2_err)?;
    Ok(())
}

fn consume_match(store: &MockStore, live: &GrpcReq) -> ParseResult<GrpcResp> {
    loop {
        let Some((entry, from_filtered)) = find_match(store, live) else {
            return Err(ParseError::NoMatch {
                operation: live
                    .headers
                    .pseudo
                    .get(":path")
                    .cloned()
                    .unwrap_or_else(|| "grpc".into()),
            });
        };
        let ProtocolPayload::Grpc { resp, .. } = &entry.mock.spec.payload else {
            return Err(ParseError::Codec("grpc mock holds foreign payload".into()));
        };
        let resp = resp.clone();

        if from_filtered {
            if !store.delete_filtered(&entry) {
                continue;
            }
        } else if let Err(e) = store.flag_as_used(&entry) {
            warn!("failed to flag grpc mock as used: {e}");
        }
        return Ok(resp);
    }
}

fn find_match(store: &MockStore, live: &GrpcReq) -> Option<(MockEntry, bool)> {
    for (entries, from_filtered) in [(store.get_filtered(), true), (store.get_unfiltered(), false)]
    {
        let best = entries
            .into_iter()
            .filter(|e| e.mock.kind == MockKind::Grpc)
            .filter_map(|e| {
                let ProtocolPayload::Grpc { req, .. } = &e.mock.spec.payload else {
                    return None;
                };
                if !headers::headers_match(&req.headers, &live.headers) {
                    return None;
                }
                let similarity = headers::body_similarity(&req.body, &live.body);
                Some((e, similarity))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((entry, similarity)) = best {
            debug!(mock = %entry.mock.name, similarity, "grpc stream matched");
            return Some((entry, from_filtered));
        }
    }
    None
}

fn ensure_absolute(uri: http::Uri) -> ParseResult<http::Uri> {
    if uri.scheme().is_some() {
        return Ok(uri);
    }
    let mut parts = uri.into_parts();
    parts.scheme = Some(http::uri::Scheme::HTTP);
    if parts.authority.is_none() {
        parts.authority = Some(
            http::uri::Authority::try_from("localhost")
                .map_err(|e| ParseError::Codec(format!("authority: {e}")))?,
        );
    }
    http::Uri::from_parts(parts).map_err(|e| ParseError::Codec(format!("uri rebuild: {e}")))
}
