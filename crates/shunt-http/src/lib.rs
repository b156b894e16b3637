//! Shunt HTTP/1.x parser.
//!
//! Record/replay for plain HTTP dependencies. Bodies are normalized to
//! strings in the mock model; replay sends the body exactly as
//! recorded and never forges a `Content-Length`.

pub mod codec;
pub mod parser;

pub use parser::HttpParser;
