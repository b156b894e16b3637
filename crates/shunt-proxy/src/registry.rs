//! Priority-ordered parser registry.

use std::sync::Arc;

use tracing::debug;

use crate::parser::ProtocolParser;

/// The dispatch table. Populated at startup, read-only afterwards.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn ProtocolParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parser. Lower priority dispatches first; equal
    /// priorities keep registration order.
    pub fn register(&mut self, parser: Arc<dyn ProtocolParser>) {
        debug!(
            parser = parser.name(),
            priority = parser.priority(),
            "parser registered"
        );
        self.parsers.push(parser);
        self.parsers.sort_by_key(|p| p.priority());
    }

    /// Pick the first parser whose `match_type` claims the peeked bytes.
    pub fn classify(&self, peeked: &[u8]) -> Option<Arc<dyn ProtocolParser>> {
        self.parsers
            .iter()
            .find(|p| p.match_type(peeked))
            .map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}
