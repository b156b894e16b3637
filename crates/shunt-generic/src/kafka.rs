//! Kafka detection stub.
//!
//! Recognizes the Kafka request header shape (4-byte big-endian length,
//! plausible api key and version) so Kafka traffic is tagged with its
//! own mock kind, but records and replays through the generic byte
//! engine. There is no Kafka wire decoding.

use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::ParseResult;
use shunt_core::mock::MockKind;
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_proxy::parser::{BoxedStream, ProtocolParser};
use shunt_proxy::peek::PeekedStream;
use shunt_store::MockStore;

use crate::engine;

/// Highest api key Kafka has assigned (with headroom for new ones).
const MAX_API_KEY: i16 = 80;
const MAX_API_VERSION: i16 = 20;

#[derive(Debug, Default)]
pub struct KafkaParser;

#[async_trait]
impl ProtocolParser for KafkaParser {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn kind(&self) -> MockKind {
        MockKind::Kafka
    }

    fn match_type(&self, peeked: &[u8]) -> bool {
        if peeked.len() < 8 {
            return false;
        }
        let length = BigEndian::read_i32(&peeked[0..4]);
        let api_key = BigEndian::read_i16(&peeked[4..6]);
        let api_version = BigEndian::read_i16(&peeked[6..8]);
        length >= 8
            && length < 16 * 1024 * 1024
            && (0..=MAX_API_KEY).contains(&api_key)
            && (0..=MAX_API_VERSION).contains(&api_version)
    }

    async fn record_outgoing(
        &self,
        client: PeekedStream,
        dest: BoxedStream,
        ctx: &ConnContext,
        sink: &MockSink,
        _opts: &Options,
    ) -> ParseResult<()> {
        engine::record_bytes(client, dest, MockKind::Kafka, ctx, sink).await
    }

    async fn mock_outgoing(
        &self,
        client: PeekedStream,
        _dst: Option<&ConditionalDstCfg>,
        store: Arc<MockStore>,
        ctx: &ConnContext,
        opts: &Options,
    ) -> ParseResult<()> {
        engine::replay_bytes(client, MockKind::Kafka, store, ctx, opts).await
    }
}
