//! Error taxonomy shared by the dispatcher and every protocol parser.

use thiserror::Error;

/// Result type alias for parser and dispatcher operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors that can occur while recording or replaying a connection.
///
/// Transient terminations (peer close at a frame boundary, cancellation)
/// are not represented here; parsers return `Ok(())` for those.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected end of stream mid-frame")]
    UnexpectedEof,

    #[error("no mock matched request for {operation}")]
    NoMatch { operation: String },

    #[error("store contention, caller should re-match")]
    StoreContention,

    #[error("payload of {0} bytes exceeds the fuzzy match limit")]
    PayloadTooLarge(usize),

    #[error("no destination configured for passthrough")]
    MissingDestination,

    #[error("connection cancelled")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(String),
}

impl ParseError {
    /// Whether this error is a benign termination that the session logs
    /// at debug level instead of propagating.
    pub fn is_benign(&self) -> bool {
        match self {
            ParseError::Cancelled => true,
            ParseError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
