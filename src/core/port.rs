//! The per-endpoint record and its external handle.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::event::Event;
use super::message::UserMessage;
use super::message_queue::MessageQueue;
use super::name::{NodeName, PortName};

/// Opaque observer handle an embedder may attach to a port.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Lifecycle of a port.
///
/// `Receiving → Closed` is terminal. A port that has been transferred walks
/// `Buffering → Proxying → Closed` instead, where the final step is proxy
/// retirement. Transitions are driven by incoming events, never by the
/// embedder directly (except `close_port`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    /// Created but not yet entangled; outbound messages buffer locally.
    Uninitialized,
    /// The authoritative endpoint; its peer address is live.
    Receiving,
    /// Handed off to a new home that has not yet confirmed.
    Buffering,
    /// Forwarding every message toward the new home, stamps preserved.
    Proxying,
    /// Closed locally; the record is about to leave the registry.
    Closed,
}

/// Everything mutable about a port, guarded by the port's single lock.
pub(crate) struct PortInner {
    pub state: PortState,
    pub peer_node: NodeName,
    pub peer_port: PortName,
    /// Monotone counter stamped into outgoing user messages.
    pub next_sequence_num_to_send: u64,
    /// Final stamp this port will ever receive; zero while unknown.
    pub last_sequence_num_to_receive: u64,
    pub message_queue: MessageQueue,
    /// Messages sent while still `Uninitialized`, flushed on initialization.
    pub outgoing_messages: VecDeque<UserMessage>,
    /// Ports carried by those buffered messages; their peer node is rewritten
    /// once the real destination is known.
    pub outgoing_ports: Vec<Arc<Port>>,
    /// Deferred ack to emit when this proxy finally retires.
    pub send_on_proxy_removal: Option<(NodeName, Event)>,
    pub user_data: Option<UserData>,
    /// Set once retirement is authorized (proxy ack or peer closure).
    pub remove_proxy_on_last_message: bool,
    pub peer_closed: bool,
}

impl PortInner {
    /// Whether this port still expects messages it has not released.
    ///
    /// Once the peer closed (or retirement was authorized) and the queue has
    /// drained up to the advertised boundary, nothing further is owed: user
    /// reads report `PeerClosed` and late arrivals are rejected. A boundary
    /// of zero with nothing received counts as already drained.
    pub fn can_accept_more_messages(&self) -> bool {
        if self.peer_closed || self.remove_proxy_on_last_message {
            let next_sequence_num = self.message_queue.next_sequence_num();
            if self.last_sequence_num_to_receive == next_sequence_num - 1 {
                return false;
            }
        }
        true
    }
}

/// One endpoint record. Owned by its node's registry; externally reachable
/// only through short-lived [`PortRef`] handles.
pub struct Port {
    inner: Mutex<PortInner>,
}

impl Port {
    pub(crate) fn new(next_sequence_num_to_send: u64, next_sequence_num_to_receive: u64) -> Self {
        Self {
            inner: Mutex::new(PortInner {
                state: PortState::Uninitialized,
                peer_node: NodeName::INVALID,
                peer_port: PortName::INVALID,
                next_sequence_num_to_send,
                last_sequence_num_to_receive: 0,
                message_queue: MessageQueue::with_next_sequence_num(next_sequence_num_to_receive),
                outgoing_messages: VecDeque::new(),
                outgoing_ports: Vec::new(),
                send_on_proxy_removal: None,
                user_data: None,
                remove_proxy_on_last_message: false,
                peer_closed: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PortInner> {
        self.inner.lock().expect("port lock poisoned")
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port").finish_non_exhaustive()
    }
}

/// Handle to a registered port: its name plus a shared reference to the
/// record. Cheap to clone; holding one does not keep the port registered.
#[derive(Clone)]
pub struct PortRef {
    name: PortName,
    port: Arc<Port>,
}

impl PortRef {
    pub(crate) fn new(name: PortName, port: Arc<Port>) -> Self {
        Self { name, port }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    pub(crate) fn port(&self) -> &Arc<Port> {
        &self.port
    }
}

impl fmt::Debug for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortRef({})", self.name)
    }
}

/// Snapshot returned by `Node::get_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortStatus {
    pub has_messages: bool,
    pub peer_closed: bool,
}
