#![forbid(unsafe_code)]

//! Location-transparent message passing between entangled port pairs.
//!
//! A [`Node`] routes messages between named endpoints ("ports"). Ports come in
//! entangled pairs: sending on one delivers, in order, to the other, even while
//! either endpoint is being transferred between nodes inside a message. The
//! routing graph self-heals after a transfer: the old home briefly proxies,
//! announces its replacement to the sender, and retires once every message it
//! was ever going to see has passed through.
//!
//! The crate owns no threads and performs no I/O. An embedder supplies a
//! [`NodeDelegate`] that ships events between nodes and receives readability
//! wakeups; everything else is synchronous bookkeeping under per-port locks.

pub mod core;
pub mod node;
pub mod test_harness;

pub use crate::core::{
    Event, EventData, NodeName, ObserveProxy, PortDescriptor, PortError, PortName, PortRef,
    PortStatus, UserData, UserMessage, INITIAL_SEQUENCE_NUM, INVALID_SEQUENCE_NUM,
};
pub use crate::node::{Node, NodeDelegate};

pub type Result<T> = std::result::Result<T, PortError>;
