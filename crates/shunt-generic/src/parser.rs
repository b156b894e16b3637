//! The fallback parser registered behind every protocol-aware one.

use std::sync::Arc;

use async_trait::async_trait;

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::ParseResult;
use shunt_core::mock::MockKind;
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::{BoxedStream, ProtocolParser, FALLBACK_PRIORITY};
use shunt_proxy::peek::PeekedStream;
use shunt_store::MockStore;

use crate::engine;

/// Byte-oriented parser for traffic nothing else recognized.
#[derive(Debug, Default)]
pub struct GenericParser;

#[async_trait]
impl ProtocolParser for GenericParser {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn kind(&self) -> MockKind {
        MockKind::Generic
    }

    fn priority(&self) -> u32 {
        FALLBACK_PRIORITY
    }

    fn match_type(&self, _peeked: &[u8]) -> bool {
        true
    }

    async fn record_outgoing(
        &self,
        client: PeekedStream,
        dest: BoxedStream,
        ctx: &ConnContext,
        sink: &MockSink,
        _opts: &Options,
    ) -> ParseResult<()> {
        engine::record_bytes(client, dest, MockKind::Generic, ctx, sink).await
    }

    async fn mock_outgoing(
        &self,
        client: PeekedStream,
        _dst: Option<&ConditionalDstCfg>,
        store: Arc<MockStore>,
        ctx: &ConnContext,
        opts: &Options,
    ) -> ParseResult<()> {
        engine::replay_bytes(client, MockKind::Generic, store, ctx, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ConnContext {
        ConnContext::new("127.0.0.1", CancellationToken::new())
    }

    #[tokio::test]
    async fn record_captures_both_directions() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (dest_near, mut dest_far) = tokio::io::duplex(1024);
        let (sink, mut rx) = MockSink::channel(4);

        let parser = GenericParser;
        let ctx = ctx();
        let record = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(client_near), Bytes::new());
            parser
                .record_outgoing(client, Box::new(dest_near), &ctx, &sink, &Options::default())
                .await
        });

        client_far.write_all(b"request-bytes").await.unwrap();
        let mut buf = vec![0u8; 13];
        dest_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"request-bytes");

        dest_far.write_all(b"response-bytes").await.unwrap();
        let mut buf = vec![0u8; 14];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"response-bytes");

        drop(client_far);
        drop(dest_far);
        record.await.unwrap().unwrap();

        let mock = rx.recv().await.unwrap();
        assert_eq!(mock.kind, MockKind::Generic);
        assert!(mock.test_mode_info.is_filtered);
    }

    #[tokio::test]
    async fn replay_serves_recorded_response() {
        use base64::Engine as _;
        use base64::engine::general_purpose::STANDARD as B64;
        use shunt_core::mock::{Mock, MockSpec, ProtocolPayload};

        let store = Arc::new(MockStore::new());
        store
            .load(vec![Mock::new(
                MockKind::Generic,
                "g-1",
                MockSpec::new(ProtocolPayload::Generic {
                    request_b64: B64.encode(b"ping"),
                    response_b64: B64.encode(b"pong"),
                }),
                1,
            )])
            .unwrap();

        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let parser = GenericParser;
        let ctx = ctx();
        let store_clone = Arc::clone(&store);
        let replay = tokio::spawn(async move {
            let client = PeekedStream::new(Box::new(client_near), Bytes::new());
            parser
                .mock_outgoing(client, None, store_clone, &ctx, &Options::default())
                .await
        });

        client_far.write_all(b"ping").await.unwrap();
        let mut buf = vec![0u8; 4];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");

        drop(client_far);
        replay.await.unwrap().unwrap();
        assert_eq!(store.filtered_len(), 0);
    }
}
