//! Shunt gRPC parser.
//!
//! Record/replay of gRPC unary and streaming RPCs by terminating
//! HTTP/2 on both sides of the proxy:
//!
//! - **`wiretext`** — schema-less protobuf wire rendering, the
//!   authoritative (and losslessly reversible) payload representation
//! - **`headers`** — header/trailer capture and stream matching rules
//! - **`parser`** — h2 server/client plumbing and per-stream handlers

pub mod headers;
pub mod parser;
pub mod wiretext;

pub use parser::GrpcParser;
