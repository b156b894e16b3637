//! Shunt dispatcher — per-connection protocol classification and session
//! lifecycle.
//!
//! For each accepted client connection the session peeks the opening
//! bytes, asks the parser registry which protocol state machine claims
//! them, and hands both sockets (client side and, in record mode, the
//! dialed destination) to that parser. All work runs under the
//! connection's cancellation scope.
//!
//! # Components
//!
//! - **`parser`** — the `ProtocolParser` trait every protocol crate implements
//! - **`registry`** — priority-ordered parser table
//! - **`peek`** — replay-enabled reader that re-presents peeked bytes
//! - **`pipe`** — raw bidirectional passthrough
//! - **`session`** — peek → classify → record/mock orchestration

pub mod parser;
pub mod peek;
pub mod pipe;
pub mod registry;
pub mod session;

pub use parser::{AsyncStream, BoxedStream, ProtocolParser, DEFAULT_PRIORITY, FALLBACK_PRIORITY};
pub use peek::PeekedStream;
pub use registry::ParserRegistry;
pub use session::{ProxyMode, Session};
