//! Shunt mock store — the in-memory index replay serves mocks from.
//!
//! The store is split into two partitions:
//!
//! - **filtered** — consumable mocks, ordered by `sort_order`; each is
//!   served to at most one request and then moved out
//! - **unfiltered** — reusable configuration/handshake mocks that
//!   survive the whole replay
//!
//! Every mutation is a compare-and-swap on a per-entry `(id, version)`
//! pair, so concurrent matchers racing for the same mock resolve with
//! exactly one winner; losers re-read a snapshot and re-match.

pub mod error;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::{MockEntry, MockStore};
