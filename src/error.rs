use thiserror::Error;

/// Errors produced by the dispatch core and surfaced through handler returns.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid address '{0}': {1}")]
    InvalidAddress(String, String),
    #[error("duplicate site address: {0}")]
    DuplicateSite(String),
    #[error("request body exceeds the configured limit of {0} bytes")]
    MaxBodyExceeded(usize),
    #[error("invalid matcher condition: {0}")]
    MatcherInvalid(String),
    #[error("invalid match pattern: {0}")]
    RegexInvalid(#[from] regex::Error),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("config error: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A response-writer capability the underlying connection does not provide.
///
/// The recorder hands these out from its typed accessors so upstream
/// middleware can discriminate on the missing capability instead of matching
/// error strings.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("connection is not hijackable")]
    Hijack,
    #[error("connection writer is not flushable")]
    Flush,
    #[error("connection does not signal close-notify")]
    CloseNotify,
    #[error("server push is not available on this connection")]
    Push,
}
