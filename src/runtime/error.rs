//! Per-connection failures.
//!
//! Every variant ends the connection it occurred on and nothing else.

use crate::runtime::timeout::TimeoutKind;
use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConnError {
    /// No terminator within the allowed path length.
    PathTooLong { limit: usize },
    /// Peer closed before sending a complete request.
    PeerClosed,
    /// The requested file could not be opened.
    Open { path: PathBuf, source: io::Error },
    /// Socket or file I/O failed.
    Io(io::Error),
    /// The socket accepted zero bytes of a non-empty chunk.
    WriteZero,
    /// A phase deadline passed.
    Timeout(TimeoutKind),
}

impl ConnError {
    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnError::PathTooLong { .. } => "protocol",
            ConnError::PeerClosed => "peer_closed",
            ConnError::Open { .. } | ConnError::Io(_) | ConnError::WriteZero => "resource",
            ConnError::Timeout(_) => "timeout",
        }
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::PathTooLong { limit } => {
                write!(f, "request path exceeds {limit} bytes")
            }
            ConnError::PeerClosed => write!(f, "socket closed before request was complete"),
            ConnError::Open { path, source } => {
                write!(f, "failed to open '{}': {}", path.display(), source)
            }
            ConnError::Io(e) => write!(f, "I/O error: {e}"),
            ConnError::WriteZero => write!(f, "socket write returned 0"),
            ConnError::Timeout(kind) => write!(f, "{kind} timeout"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Open { source, .. } => Some(source),
            ConnError::Io(e) => Some(e),
            _ => None,
        }
    }
}
