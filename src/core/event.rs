//! Events crossing the delegate boundary between nodes.
//!
//! Every event is addressed to a single port on the destination node. User
//! messages are queued and reordered by sequence number at the target; the
//! other tags are control events that dispatch immediately on arrival.

use serde::{Deserialize, Serialize};

use super::message::UserMessage;
use super::name::{NodeName, PortName};

/// Everything a receiving node needs to rebuild a transferred port.
///
/// The descriptor rides in a fixed slot of the carrying message, parallel to
/// the slot holding the port's name at its new home. `referring_node` /
/// `referring_port` point back at the old home so the new one can release its
/// buffer with a `PortAccepted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub peer_node: NodeName,
    pub peer_port: PortName,
    pub referring_node: NodeName,
    pub referring_port: PortName,
    pub next_sequence_num_to_send: u64,
    pub next_sequence_num_to_receive: u64,
}

impl PortDescriptor {
    /// Placeholder for a message slot the sender has not filled yet.
    pub fn invalid() -> Self {
        Self {
            peer_node: NodeName::INVALID,
            peer_port: PortName::INVALID,
            referring_node: NodeName::INVALID,
            referring_port: PortName::INVALID,
            next_sequence_num_to_send: 0,
            next_sequence_num_to_receive: 0,
        }
    }
}

impl Default for PortDescriptor {
    fn default() -> Self {
        Self::invalid()
    }
}

/// News that a port's perceived peer is actually a proxy.
///
/// Travels peer-ward along the chain until it reaches the port whose recorded
/// peer is the named proxy; that port adopts `proxy_to_*` as its new peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserveProxy {
    pub proxy_node: NodeName,
    pub proxy_port: PortName,
    pub proxy_to_node: NodeName,
    pub proxy_to_port: PortName,
}

/// Tagged payload of an [`Event`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventData {
    /// Application data, ordered by its embedded sequence number.
    User(UserMessage),
    /// The new home of a transferred port has committed; the old home may
    /// start proxying.
    PortAccepted,
    /// See [`ObserveProxy`].
    ObserveProxy(ObserveProxy),
    /// Authorizes proxy retirement up to `last_sequence_num`;
    /// `INVALID_SEQUENCE_NUM` means "ask again after your own removal".
    ObserveProxyAck { last_sequence_num: u64 },
    /// The peer closed; `last_sequence_num` is its final stamp.
    ObserveClosure { last_sequence_num: u64 },
}

/// One addressed event between nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub to_port: PortName,
    pub data: EventData,
}

impl Event {
    pub fn new(to_port: PortName, data: EventData) -> Self {
        Self { to_port, data }
    }
}
