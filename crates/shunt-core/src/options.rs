//! Runtime options threaded into the dispatcher and parsers.

use std::collections::HashSet;

/// Options recognized by the proxy core.
#[derive(Debug, Clone)]
pub struct Options {
    /// Password for re-deriving MongoDB SCRAM server signatures at replay.
    pub mongo_password: Option<String>,
    /// Forward traffic without recording or mocking anything.
    pub outgoing_disabled: bool,
    /// Destination ports that always pass through untouched.
    pub passthrough_ports: HashSet<u32>,
    /// Advisory hint for sizing the initial peek buffer.
    pub mtu: Option<usize>,
    /// Allow fuzzy (shingle/edit-distance) matching during replay.
    pub fuzzy_enabled: bool,
    /// Cap on concurrent HTTP/2 streams per gRPC connection; `None` leaves
    /// the limit to the HTTP/2 library default.
    pub max_grpc_streams: Option<u32>,
    /// Whether the generic byte parser may claim unrecognized traffic.
    pub generic_fallback: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mongo_password: None,
            outgoing_disabled: false,
            passthrough_ports: HashSet::new(),
            mtu: None,
            fuzzy_enabled: true,
            max_grpc_streams: None,
            generic_fallback: true,
        }
    }
}

impl Options {
    /// Peek buffer size: the MTU hint clamped to the 4096-byte ceiling.
    pub fn peek_len(&self) -> usize {
        self.mtu.unwrap_or(4096).clamp(16, 4096)
    }

    /// Whether traffic to `port` bypasses recording and mocking.
    pub fn is_passthrough_port(&self, port: u32) -> bool {
        self.passthrough_ports.contains(&port)
    }
}
