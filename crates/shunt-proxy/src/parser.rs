//! The protocol parser interface.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::ParseResult;
use shunt_core::mock::MockKind;
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_store::MockStore;

use crate::peek::PeekedStream;

/// Default dispatch priority for registered parsers.
pub const DEFAULT_PRIORITY: u32 = 100;

/// Priority of the generic byte parser, so it only claims traffic no
/// protocol-aware parser recognized.
pub const FALLBACK_PRIORITY: u32 = 1000;

/// Any bidirectional byte stream a parser can drive.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned, type-erased stream handle.
pub type BoxedStream = Box<dyn AsyncStream>;

/// One protocol state machine: classification plus the record and
/// replay entry points.
///
/// Implementations own both sockets for the duration of the call and
/// must respect `ctx.cancel` between frames (never mid-frame). A peer
/// close observed at a frame boundary is a clean termination, not an
/// error.
#[async_trait]
pub trait ProtocolParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> MockKind;

    /// Dispatch priority; lower wins, ties break by registration order.
    fn priority(&self) -> u32 {
        DEFAULT_PRIORITY
    }

    /// Whether the peeked opening bytes belong to this protocol.
    fn match_type(&self, peeked: &[u8]) -> bool;

    /// Record mode: drive client and destination, forwarding traffic in
    /// both directions and emitting one structured mock per exchange.
    async fn record_outgoing(
        &self,
        client: PeekedStream,
        dest: BoxedStream,
        ctx: &ConnContext,
        sink: &MockSink,
        opts: &Options,
    ) -> ParseResult<()>;

    /// Replay mode: satisfy the client entirely from the mock store. No
    /// destination socket exists unless a passthrough policy dials one.
    async fn mock_outgoing(
        &self,
        client: PeekedStream,
        dst: Option<&ConditionalDstCfg>,
        store: Arc<MockStore>,
        ctx: &ConnContext,
        opts: &Options,
    ) -> ParseResult<()>;
}
