//! Error taxonomy. Only [`RunError`] ever aborts a run; everything else is
//! absorbed where it happens and degrades into an unavailable node.

use thiserror::Error;

/// Malformed descriptor payload. The parser turns this into an unusable
/// descriptor instead of returning it.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unrecognised descriptor scheme")]
    UnknownScheme,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid structured payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid URI: {0}")]
    Uri(#[from] url::ParseError),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Subscription retrieval failure. Only the failing source is dropped.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered with status {0}")]
    Status(u16),

    #[error("giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    /// Used by test and offline fetchers.
    #[error("{0}")]
    Other(String),

    #[error("fetch cancelled")]
    Cancelled,
}

/// A single failed connection sample.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("connect timed out after {0}ms")]
    Timeout(u64),

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

/// TLS verification failure; forces the node unavailable when the gate runs.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("transport connect failed: {0}")]
    Connect(#[from] NetworkError),

    #[error("handshake timed out after {0}ms")]
    Timeout(u64),

    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
}

/// Run-level failures.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("no candidate descriptors resolved from {sources} source(s)")]
    NoCandidates { sources: usize },

    #[error("stopped while resolving sources")]
    Cancelled,
}
