//! HTTP/1.x record/replay state machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::{ParseError, ParseResult};
use shunt_core::mock::{
    self, HttpReq, HttpResp, Mock, MockKind, MockSpec, ProtocolPayload, META_CONNECTION_ID,
    META_OPERATION,
};
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::{BoxedStream, ProtocolParser};
use shunt_proxy::peek::PeekedStream;
use shunt_store::{MockEntry, MockStore};

use crate::codec::{self, HttpMessage};

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

#[derive(Debug, Default)]
pub struct HttpParser;

#[async_trait]
impl ProtocolParser for HttpParser {
    fn name(&self) -> &'static str {
        "http"
    }

    fn kind(&self) -> MockKind {
        MockKind::Http
    }

    fn match_type(&self, peeked: &[u8]) -> bool {
        // "PRI * HTTP/2" is the h2 preface, not a request we own.
        METHODS.iter().any(|m| {
            peeked.len() > m.len()
                && peeked.starts_with(m.as_bytes())
                && peeked[m.len()] == b' '
        })
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

        loop {
            let request = tokio::select! {
                r = codec::read_request(&mut client, &mut client_acc) => r?,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let Some(request) = request else {
                return Ok(());
            };
            dest.write_all(&request.raw).await?;
            dest.flush().await?;

            let head_request = request.head.method == "HEAD";
            let response = tokio::select! {
                r = codec::read_response(&mut dest, &mut dest_acc, head_request) => r?,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let Some(response) = response else {
                return Err(ParseError::UnexpectedEof);
            };
            client.write_all(&response.raw).await?;
            client.flush().await?;

            let close = request.head.wants_close()
                || response.head.wants_close()
                || unframed_body(&response);
            emit(sink, ctx, &request, &response).await;
            if close {
                return Ok(());
            }
        }
    }

    async fn mock_outgoing(
        &self,
        mut client: PeekedStream,
        _dst: Option<&ConditionalDstCfg>,
        store: Arc<MockStore>,
        ctx: &ConnContext,
        _opts: &Options,
    ) -> ParseResult<()> {
        let mut acc = BytesMut::new();

        loop {
            let request = tokio::select! {
                r = codec::read_request(&mut client, &mut acc) => r?,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let Some(request) = request else {
                return Ok(());
            };

            let resp = consume_match(&store, &request)?;
            let close = request.head.wants_close() || write_response(&mut client, &resp).await?;
            if close {
                return Ok(());
            }
        }
    }
}

fn unframed_body(response: &HttpMessage) -> bool {
    response.head.header("content-length").is_none()
        && !response
            .head
            .header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        && !response.body.is_empty()
}

fn url_params(path: &str) -> BTreeMap<String, String> {
    let Some((_, query)) = path.split_once('?') else {
        return BTreeMap::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

async fn emit(sink: &MockSink, ctx: &ConnContext, request: &HttpMessage, response: &HttpMessage) {
    let req = HttpReq {
        method: request.head.method.clone(),
        url: request.head.path.clone(),
        proto_major: 1,
        proto_minor: request.head.version_minor,
        headers: request.head.headers.clone(),
        body: String::from_utf8_lossy(&request.body).into_owned(),
        url_params: url_params(&request.head.path),
        timestamp: Utc::now(),
    };
    // The body is stored decoded, so the chunk framing header would lie
    // on replay.
    let mut resp_headers = response.head.headers.clone();
    resp_headers.remove("transfer-encoding");
    let resp = HttpResp {
        status_code: response.head.status,
        status_message: response.head.reason.clone(),
        headers: resp_headers,
        body: String::from_utf8_lossy(&response.body).into_owned(),
        timestamp: Utc::now(),
    };

    let operation = format!("{} {}", req.method, req.url);
    let order = mock::next_sort_order();
    let spec = MockSpec::new(ProtocolPayload::Http { req, resp })
        .with_meta(META_OPERATION, operation)
        .with_meta(META_CONNECTION_ID, ctx.client_conn_id.clone());
    sink.send(Mock::new(MockKind::Http, format!("http-{order}"), spec, order))
        .await;
}

fn consume_match(store: &MockStore, request: &HttpMessage) -> ParseResult<HttpResp> {
    let body = String::from_utf8_lossy(&request.body);
    loop {
        let Some((entry, from_filtered)) =
            find_match(store, &request.head.method, &request.head.path, &body)
        else {
            return Err(ParseError::NoMatch {
                operation: format!("{} {}", request.head.method, request.head.path),
            });
        };
        let ProtocolPayload::Http { resp, .. } = &entry.mock.spec.payload else {
            return Err(ParseError::Codec("http mock holds foreign payload".into()));
        };
        let resp = resp.clone();

        if from_filtered {
            if !store.delete_filtered(&entry) {
                continue;
            }
        } else if let Err(e) = store.flag_as_used(&entry) {
            warn!("failed to flag http mock as used: {e}");
        }
        return Ok(resp);
    }
}

fn find_match(
    store: &MockStore,
    method: &str,
    url: &str,
    body: &str,
) -> Option<(MockEntry, bool)> {
    for (entries, from_filtered) in [(store.get_filtered(), true), (store.get_unfiltered(), false)]
    {
        let candidates: Vec<MockEntry> = entries
            .into_iter()
            .filter(|e| e.mock.kind == MockKind::Http)
            .collect();

        let exact = candidates.iter().find(|e| {
            let ProtocolPayload::Http { req, .. } = &e.mock.spec.payload else {
                return false;
            };
            req.method == method && req.url == url && req.body == body
        });
        if let Some(entry) = exact {
            return Some((entry.clone(), from_filtered));
        }

        // Schema tier: same method and url, body allowed to drift.
        let loose = candidates.iter().find(|e| {
            let ProtocolPayload::Http { req, .. } = &e.mock.spec.payload else {
                return false;
            };
            req.method == method && req.url == url
        });
        if let Some(entry) = loose {
            debug!(mock = %entry.mock.name, "http match ignoring body drift");
            return Some((entry.clone(), from_filtered));
        }
    }
    None
}

/// Write a stored response. Returns `true` when the connection must
/// close because the body has no framing header.
async fn write_response(client: &mut PeekedStream, resp: &HttpResp) -> ParseResult<bool> {
    let mut out = Vec::new();
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", resp.status_code, resp.status_message).as_bytes(),
    );
    for (name, value) in &resp.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    // The body is sent exactly as recorded; no Content-Length is forged.
    out.extend_from_slice(resp.body.as_bytes());
    client.write_all(&out).await?;
    client.flush().await?;

    let framed = resp.headers.contains_key("content-length") || resp.body.is_empty();
    Ok(!framed)
}
