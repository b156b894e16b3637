//! Shunt Redis parser — RESP record/replay.
//!
//! Matching runs three tiers in order: exact byte equality on the
//! filtered partition, k-shingle Jaccard similarity (floor 0.9) on the
//! filtered partition, then the same pair against the unfiltered
//! partition with a 0.4 floor. A filtered hit is consumed atomically.

pub mod parser;
pub mod resp;

pub use parser::RedisParser;
