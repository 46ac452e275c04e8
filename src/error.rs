use std::io;

use thiserror::Error;

/// Rejections raised while turning a configuration document into runtime zones.
/// None of these can surface during query handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory property: {0:?}")]
    MissingProperty(&'static str),
    #[error("wrong argument count for {0:?}")]
    ArgCount(&'static str),
    #[error("not an IP address: {0:?}")]
    NotAnIpAddress(String),
    #[error("unsupported transport scheme: {0:?}")]
    UnsupportedScheme(String),
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error("invalid DoH url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unknown policy: {0:?}")]
    UnknownPolicy(String),
    #[error("{property}: minimal interval is {min_ms}ms, got {got_ms}ms")]
    IntervalTooShort {
        property: &'static str,
        min_ms: u64,
        got_ms: u64,
    },
    #[error("{property}: at most {max}, got {got}")]
    OutOfRange {
        property: &'static str,
        max: u64,
        got: u64,
    },
    #[error("INLINE {0:?} is forbidden since \".\" will match all requests")]
    InlineWithMatchAll(Vec<String>),
    #[error("{0:?} mixes \".\" with tags")]
    MatchAllWithTags(Vec<String>),
    #[error("invalid network {value:?}: {reason}")]
    InvalidNetwork { value: String, reason: String },
    #[error("invalid address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },
    #[error("no zones configured")]
    NoZones,
}

/// A failed exchange with one upstream host.
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    /// The remote side closed a connection we had cached; a fresh one may succeed.
    #[error("cached connection was closed by peer")]
    CachedConnClosed,
    #[error("exchange timed out after {0}ms")]
    Timeout(u64),
    #[error("io error: {0}")]
    Io(String),
    #[error("dns protocol error: {0}")]
    Proto(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("http error: {0}")]
    Http(String),
}

impl From<io::Error> for ExchangeError {
    fn from(err: io::Error) -> Self {
        ExchangeError::Io(err.to_string())
    }
}

impl From<hickory_proto::error::ProtoError> for ExchangeError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        ExchangeError::Proto(err.to_string())
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Http(err.to_string())
    }
}

/// Terminal per-query failures. Both answer the client with SERVFAIL.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no healthy upstream host")]
    NoHealthyHost,
    #[error("deadline exceeded, last error: {last}")]
    DeadlineExceeded { last: ExchangeError },
}
