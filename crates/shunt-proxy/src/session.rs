//! Per-connection session: peek, classify, dispatch.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use shunt_core::context::{ConditionalDstCfg, ConnContext};
use shunt_core::error::{ParseError, ParseResult};
use shunt_core::options::Options;
use shunt_core::sink::MockSink;
use shunt_store::MockStore;

use crate::parser::{BoxedStream, FALLBACK_PRIORITY};
use crate::peek::PeekedStream;
use crate::pipe::duplex_pipe;
use crate::registry::ParserRegistry;

/// What a session does with classified traffic.
#[derive(Clone)]
pub enum ProxyMode {
    /// Forward to the real destination and emit mocks to the sink.
    Record {
        dest: ConditionalDstCfg,
        sink: MockSink,
    },
    /// Serve from the store; `dest` is only used for passthrough policies.
    Replay {
        store: Arc<MockStore>,
        dest: Option<ConditionalDstCfg>,
    },
}

/// Drives one accepted client connection through its lifecycle.
pub struct Session {
    registry: Arc<ParserRegistry>,
    opts: Arc<Options>,
}

impl Session {
    pub fn new(registry: Arc<ParserRegistry>, opts: Arc<Options>) -> Self {
        Self { registry, opts }
    }

    /// Handle one connection to completion.
    ///
    /// Cancelling `cancel` tears down everything derived from the
    /// connection; benign terminations (peer close, cancellation) are
    /// absorbed here and reported as success.
    pub async fn handle(
        &self,
        client: BoxedStream,
        client_ip: String,
        mode: ProxyMode,
        cancel: CancellationToken,
    ) -> ParseResult<()> {
        let ctx = ConnContext::new(client_ip, cancel);
        match self.run(client, mode, &ctx).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_benign() => {
                debug!(conn = %ctx.client_conn_id, "connection ended: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run(&self, mut client: BoxedStream, mode: ProxyMode, ctx: &ConnContext) -> ParseResult<()> {
        // Peek the opening bytes without consuming them from the
        // parser's point of view.
        let mut peek_buf = vec![0u8; self.opts.peek_len()];
        let n = tokio::select! {
            n = client.read(&mut peek_buf) => n?,
            _ = ctx.cancel.cancelled() => return Ok(()),
        };
        if n == 0 {
            debug!(conn = %ctx.client_conn_id, "client closed before first byte");
            return Ok(());
        }
        peek_buf.truncate(n);
        let peeked = Bytes::from(peek_buf);
        let client = PeekedStream::new(client, peeked.clone());

        // Passthrough policies short-circuit before classification.
        if self.should_passthrough(&mode) {
            return self.passthrough(client, &mode, ctx).await;
        }

        let Some(parser) = self.registry.classify(&peeked) else {
            return Err(ParseError::NoMatch {
                operation: "protocol dispatch".into(),
            });
        };
        if parser.priority() >= FALLBACK_PRIORITY && !self.opts.generic_fallback {
            return Err(ParseError::NoMatch {
                operation: "protocol dispatch (generic fallback disabled)".into(),
            });
        }
        debug!(
            conn = %ctx.client_conn_id,
            parser = parser.name(),
            peeked = peeked.len(),
            "parser selected"
        );

        match mode {
            ProxyMode::Record { dest, sink } => {
                let upstream = dial(&dest).await?;
                parser
                    .record_outgoing(client, upstream, ctx, &sink, &self.opts)
                    .await
            }
            ProxyMode::Replay { store, dest } => {
                parser
                    .mock_outgoing(client, dest.as_ref(), store, ctx, &self.opts)
                    .await
            }
        }
    }

    fn should_passthrough(&self, mode: &ProxyMode) -> bool {
        if self.opts.outgoing_disabled {
            return true;
        }
        let dest = match mode {
            ProxyMode::Record { dest, .. } => Some(dest),
            ProxyMode::Replay { dest, .. } => dest.as_ref(),
        };
        dest.is_some_and(|d| self.opts.is_passthrough_port(d.port))
    }

    async fn passthrough(
        &self,
        client: PeekedStream,
        mode: &ProxyMode,
        ctx: &ConnContext,
    ) -> ParseResult<()> {
        let dest = match mode {
            ProxyMode::Record { dest, .. } => dest.clone(),
            ProxyMode::Replay { dest, .. } => {
                dest.clone().ok_or(ParseError::MissingDestination)?
            }
        };
        debug!(conn = %ctx.client_conn_id, dest = %dest.endpoint(), "passthrough");
        let upstream = dial(&dest).await?;
        duplex_pipe(Box::new(client), upstream, &ctx.cancel).await
    }
}

/// Dial the recorded destination. TLS origination is the redirect
/// layer's concern; the flag is only logged here.
async fn dial(dest: &ConditionalDstCfg) -> ParseResult<BoxedStream> {
    if dest.tls {
        warn!(dest = %dest.endpoint(), "destination marked tls, connecting in the clear");
    }
    let stream = TcpStream::connect(dest.endpoint()).await?;
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use shunt_core::mock::MockKind;

    struct EchoNameParser {
        name: &'static str,
        prefix: &'static [u8],
        priority: u32,
    }

    #[async_trait]
    impl crate::parser::ProtocolParser for EchoNameParser {
        fn name(&self) -> &'static str {
            self.name
        }

        fn kind(&self) -> MockKind {
            MockKind::Generic
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn match_type(&self, peeked: &[u8]) -> bool {
            self.prefix.is_empty() || peeked.starts_with(self.prefix)
        }

        async fn record_outgoing(
            &self,
            _client: PeekedStream,
            _dest: BoxedStream,
            _ctx: &ConnContext,
            _sink: &MockSink,
            _opts: &Options,
        ) -> ParseResult<()> {
            Ok(())
        }

        async fn mock_outgoing(
            &self,
            mut client: PeekedStream,
            _dst: Option<&ConditionalDstCfg>,
            _store: Arc<MockStore>,
            _ctx: &ConnContext,
            _opts: &Options,
        ) -> ParseResult<()> {
            // Echo the parser name so tests can observe the dispatch.
            client.write_all(self.name.as_bytes()).await?;
            Ok(())
        }
    }

    fn registry() -> Arc<ParserRegistry> {
        let mut registry = ParserRegistry::new();
        registry.register(Arc::new(EchoNameParser {
            name: "resp",
            prefix: b"*",
            priority: 100,
        }));
        registry.register(Arc::new(EchoNameParser {
            name: "generic",
            prefix: b"",
            priority: FALLBACK_PRIORITY,
        }));
        Arc::new(registry)
    }

    fn replay_mode() -> ProxyMode {
        ProxyMode::Replay {
            store: Arc::new(MockStore::new()),
            dest: None,
        }
    }

    #[tokio::test]
    async fn dispatch_picks_matching_parser() {
        let session = Session::new(registry(), Arc::new(Options::default()));
        let (near, mut far) = tokio::io::duplex(256);

        let handle = tokio::spawn(async move {
            far.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
            let mut out = vec![0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut far, &mut out)
                .await
                .unwrap();
            out
        });

        session
            .handle(
                Box::new(near),
                "127.0.0.1".into(),
                replay_mode(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), b"resp");
    }

    #[tokio::test]
    async fn unknown_bytes_fall_back_to_generic() {
        let session = Session::new(registry(), Arc::new(Options::default()));
        let (near, mut far) = tokio::io::duplex(256);

        let handle = tokio::spawn(async move {
            far.write_all(b"\x01\x02mystery").await.unwrap();
            let mut out = vec![0u8; 7];
            tokio::io::AsyncReadExt::read_exact(&mut far, &mut out)
                .await
                .unwrap();
            out
        });

        session
            .handle(
                Box::new(near),
                "127.0.0.1".into(),
                replay_mode(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), b"generic");
    }

    #[tokio::test]
    async fn disabled_fallback_reports_no_match() {
        let opts = Options {
            generic_fallback: false,
            ..Default::default()
        };
        let session = Session::new(registry(), Arc::new(opts));
        let (near, mut far) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let _ = far.write_all(b"\x01\x02mystery").await;
            // Keep the far end open so the session decides on its own.
            std::future::pending::<()>().await;
        });

        let err = session
            .handle(
                Box::new(near),
                "127.0.0.1".into(),
                replay_mode(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NoMatch { .. }));
    }

    #[tokio::test]
    async fn immediate_close_is_clean() {
        let session = Session::new(registry(), Arc::new(Options::default()));
        let (near, far) = tokio::io::duplex(256);
        drop(far);

        session
            .handle(
                Box::new(near),
                "127.0.0.1".into(),
                replay_mode(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn outgoing_disabled_pipes_verbatim_and_records_nothing() {
        // Real upstream the passthrough dials.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut sock, &mut buf)
                .await
                .unwrap();
            assert_eq!(buf, b"hello");
            sock.write_all(b"world").await.unwrap();
        });

        let opts = Options {
            outgoing_disabled: true,
            ..Default::default()
        };
        let session = Session::new(registry(), Arc::new(opts));
        let (sink, mut rx) = MockSink::channel(8);
        let mode = ProxyMode::Record {
            dest: ConditionalDstCfg::new(addr.ip().to_string(), addr.port() as u32),
            sink,
        };

        let (near, mut far) = tokio::io::duplex(256);
        let client = tokio::spawn(async move {
            far.write_all(b"hello").await.unwrap();
            let mut out = vec![0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut far, &mut out)
                .await
                .unwrap();
            assert_eq!(out, b"world");
            drop(far);
        });

        session
            .handle(
                Box::new(near),
                "127.0.0.1".into(),
                mode,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        upstream.await.unwrap();
        client.await.unwrap();
        assert!(rx.try_recv().is_err(), "no mock may be emitted");
    }
}
