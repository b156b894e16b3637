//! Per-connection context carried through every parser.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

static NEXT_CONN: AtomicU64 = AtomicU64::new(0);

/// The true destination of an intercepted connection, as reported by
/// the external traffic redirect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalDstCfg {
    pub addr: String,
    pub port: u32,
    pub tls: bool,
}

impl ConditionalDstCfg {
    pub fn new(addr: impl Into<String>, port: u32) -> Self {
        Self {
            addr: addr.into(),
            port,
            tls: false,
        }
    }

    /// Full `host:port` string for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Lightweight record carried through every parser invocation.
///
/// Cancelling `cancel` terminates all work derived from the connection;
/// parsers hand `child()` tokens to their spawned workers so the whole
/// tree tears down together.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub client_conn_id: String,
    pub dest_conn_id: String,
    pub client_ip: String,
    pub cancel: CancellationToken,
}

impl ConnContext {
    /// Allocate a fresh context with process-unique connection ids.
    pub fn new(client_ip: impl Into<String>, cancel: CancellationToken) -> Self {
        let n = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
        Self {
            client_conn_id: format!("client-{n}"),
            dest_conn_id: format!("dest-{n}"),
            client_ip: client_ip.into(),
            cancel,
        }
    }

    /// A child token for a worker task spawned under this connection.
    pub fn child(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_unique() {
        let a = ConnContext::new("10.0.0.1", CancellationToken::new());
        let b = ConnContext::new("10.0.0.1", CancellationToken::new());
        assert_ne!(a.client_conn_id, b.client_conn_id);
        assert_ne!(a.dest_conn_id, b.dest_conn_id);
    }

    #[test]
    fn child_tokens_cancel_with_parent() {
        let ctx = ConnContext::new("10.0.0.1", CancellationToken::new());
        let child = ctx.child();
        assert!(!child.is_cancelled());
        ctx.cancel.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn endpoint_formats_host_port() {
        let dst = ConditionalDstCfg::new("db.internal", 27017);
        assert_eq!(dst.endpoint(), "db.internal:27017");
        assert!(!dst.tls);
    }
}
