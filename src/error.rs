//! Error types for the heartbeat-pool crate.

use thiserror::Error;

/// Fatal startup error. The process cannot run without its credential
/// and backlog files, so these terminate it with a non-zero exit code.
#[derive(Debug, Error)]
#[error("failed to load {what} from {path}")]
pub struct StartupError {
    /// What was being loaded ("credential", "backlog").
    pub what: &'static str,
    /// Path that was read.
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

/// Classification of a failed remote call.
///
/// Blacklisting decisions are made on this kind, never by matching
/// substrings of a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The call did not complete within the client timeout.
    Timeout,
    /// The connection could not be established (egress dead, refused, TLS).
    Connect,
    /// The remote answered with a non-2xx HTTP status.
    ServerError(u16),
    /// The response body could not be parsed, or carried a negative code.
    Protocol,
}

impl TransportErrorKind {
    /// Whether a negotiation failure of this kind should retire the egress
    /// from future admission. Covers the remote dying mid-keepalive and
    /// hard server errors.
    pub fn is_fatal_for_egress(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::Timeout | TransportErrorKind::ServerError(500)
        )
    }
}

/// A failed call to a remote endpoint, with its typed classification.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} error calling {url}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub url: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
        }
    }
}
