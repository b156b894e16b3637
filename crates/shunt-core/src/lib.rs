//! Shunt core — the shared foundation for the record/replay proxy.
//!
//! This crate holds everything the protocol parsers have in common:
//!
//! - **`mock`** — the `Mock` data model, one serde-friendly shape per protocol
//! - **`context`** — per-connection context with hierarchical cancellation
//! - **`options`** — runtime options threaded into every parser
//! - **`error`** — the error taxonomy shared across crates
//! - **`matching`** — fuzzy and structural matching primitives
//! - **`sink`** — the bounded channel parsers emit recorded mocks into
//! - **`framing`** — length-prefixed frame readers over async streams

pub mod context;
pub mod error;
pub mod framing;
pub mod matching;
pub mod mock;
pub mod options;
pub mod sink;

pub use context::{ConditionalDstCfg, ConnContext};
pub use error::{ParseError, ParseResult};
pub use mock::{Mock, MockKind, MockSpec, TestModeInfo};
pub use options::Options;
pub use sink::MockSink;
