//! # Fault Definitions
//!
//! The central ledger of local and remote failures.
//!
//! A `Fault` is what every fallible peerlink operation returns. Faults raised
//! on the far side of the connection arrive as `Fault::Remote`, carrying the
//! kind and message the remote side reported.

use std::fmt;

use crate::transport::TransportError;

/// Everything that can go wrong while talking to a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The value cannot cross the wire (foreign proxy, heterogeneous array, schema violation).
    Unmarshalable(String),
    /// A value could not be adapted to the shape the receiver declared.
    TypeMismatch { expected: String, found: String },
    /// The reply did not arrive before the call deadline.
    Timeout,
    /// The session was closed before the operation completed.
    ConnectionClosed,
    /// The peer violated the protocol. Closes the session.
    Protocol(String),
    /// A frame referenced a handle this side never issued. Closes the session.
    UnknownHandle(u32),
    /// The target does not expose the method, property or interface.
    MemberNotFound(String),
    /// An application handler failed locally.
    Application(String),
    /// The remote handler failed; the fault is re-raised here.
    Remote(RemoteFault),
    /// The byte-level format was malformed.
    Codec(peerpack::Error),
    /// The transport failed. Closes the session.
    Transport(TransportError),
}

/// A fault as it travels inside a reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    pub kind: String,
    pub message: String,
}

impl Fault {
    /// Short stable name used as the `kind` of a `RemoteFault`.
    pub fn kind(&self) -> &str {
        match self {
            Fault::Unmarshalable(_) => "unmarshalable",
            Fault::TypeMismatch { .. } => "type_mismatch",
            Fault::Timeout => "timeout",
            Fault::ConnectionClosed => "connection_closed",
            Fault::Protocol(_) => "protocol",
            Fault::UnknownHandle(_) => "unknown_handle",
            Fault::MemberNotFound(_) => "member_not_found",
            Fault::Application(_) => "application",
            Fault::Remote(remote) => &remote.kind,
            Fault::Codec(_) => "codec",
            Fault::Transport(_) => "transport",
        }
    }

    /// Whether this fault leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Fault::Protocol(_) | Fault::UnknownHandle(_) | Fault::Codec(_) | Fault::Transport(_)
        )
    }

    /// Converts the fault into its wire form. Remote faults pass through untouched.
    pub fn to_remote(&self) -> RemoteFault {
        match self {
            Fault::Remote(remote) => remote.clone(),
            other => RemoteFault { kind: other.kind().to_string(), message: other.to_string() },
        }
    }

    pub(crate) fn mismatch(expected: impl fmt::Display, found: impl fmt::Display) -> Self {
        Fault::TypeMismatch { expected: expected.to_string(), found: found.to_string() }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Unmarshalable(msg) => write!(f, "value cannot be marshaled: {}", msg),
            Fault::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, found {}", expected, found)
            }
            Fault::Timeout => write!(f, "call timed out"),
            Fault::ConnectionClosed => write!(f, "connection closed"),
            Fault::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Fault::UnknownHandle(id) => write!(f, "unknown handle {:#010x}", id),
            Fault::MemberNotFound(name) => write!(f, "member not found: {}", name),
            Fault::Application(msg) => write!(f, "{}", msg),
            Fault::Remote(remote) => write!(f, "remote {}: {}", remote.kind, remote.message),
            Fault::Codec(e) => write!(f, "codec error: {}", e),
            Fault::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Fault::Codec(e) => Some(e),
            Fault::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<peerpack::Error> for Fault {
    fn from(e: peerpack::Error) -> Self {
        Fault::Codec(e)
    }
}

impl From<TransportError> for Fault {
    fn from(e: TransportError) -> Self {
        Fault::Transport(e)
    }
}

impl From<RemoteFault> for Fault {
    fn from(e: RemoteFault) -> Self {
        Fault::Remote(e)
    }
}

/// A specialized Result type for peerlink operations.
pub type Result<T> = std::result::Result<T, Fault>;
