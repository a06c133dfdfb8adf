//! Routing-core error codes.
//!
//! These are bounded and stable: every code names either an operational
//! refusal (wrong state, unknown name, closed peer) or an invariant violation
//! surfaced to the embedder instead of a panic. The core never crashes on a
//! violation; the embedder may choose to treat one as fatal.

use thiserror::Error;

/// Canonical error enum returned by every fallible node operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PortError {
    /// No port with the given name is registered on this node.
    #[error("port unknown")]
    PortUnknown,
    /// A port with the given name already exists. Indicates a defective
    /// name generator on the embedder side.
    #[error("port already exists")]
    PortExists,
    /// The port is not in a state that permits the requested operation.
    #[error("port state unexpected")]
    PortStateUnexpected,
    /// A message may not carry the very port it is being sent on.
    #[error("cannot send a port over itself")]
    CannotSendSelf,
    /// A message may not carry a port addressed to the message's destination.
    #[error("cannot send a port to its own peer")]
    CannotSendPeer,
    /// The peer endpoint closed and every message it sent has been consumed.
    #[error("peer closed")]
    PeerClosed,
    /// Reserved for wire-level embedders that must map an unrecognized
    /// event tag to a code.
    #[error("not implemented")]
    NotImplemented,
}

pub type Result<T> = std::result::Result<T, PortError>;
