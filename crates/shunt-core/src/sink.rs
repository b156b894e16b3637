//! The channel parsers emit recorded mocks into.
//!
//! The consumer (the daemon, or a test harness) owns the receiving end
//! and is responsible for durable persistence. A closed receiver must
//! never take a live connection down with it, so sends into a dead sink
//! degrade to a logged drop.

use tokio::sync::mpsc;
use tracing::warn;

use crate::mock::Mock;

/// Clonable producer handle over a bounded mock channel.
#[derive(Debug, Clone)]
pub struct MockSink {
    tx: mpsc::Sender<Mock>,
}

impl MockSink {
    /// Create a sink and its consuming receiver with the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Mock>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Emit a recorded mock, waiting for channel capacity.
    pub async fn send(&self, mock: Mock) {
        let name = mock.name.clone();
        if self.tx.send(mock).await.is_err() {
            warn!(mock = %name, "mock sink closed, dropping recorded mock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockKind, MockSpec, ProtocolPayload};

    fn generic_mock(name: &str) -> Mock {
        Mock::new(
            MockKind::Generic,
            name,
            MockSpec::new(ProtocolPayload::Generic {
                request_b64: "cmVx".into(),
                response_b64: "cmVzcA==".into(),
            }),
            0,
        )
    }

    #[tokio::test]
    async fn sink_delivers_in_order() {
        let (sink, mut rx) = MockSink::channel(4);
        sink.send(generic_mock("a")).await;
        sink.send(generic_mock("b")).await;
        assert_eq!(rx.recv().await.unwrap().name, "a");
        assert_eq!(rx.recv().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn send_into_closed_sink_does_not_panic() {
        let (sink, rx) = MockSink::channel(1);
        drop(rx);
        sink.send(generic_mock("dropped")).await;
    }
}
