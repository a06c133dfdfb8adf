//! The contract a routing node offers its embedder.

use bytes::Bytes;

use crate::core::{Event, NodeName, PortName, PortRef, UserMessage};

/// Hooks a [`Node`](crate::Node) uses to reach the rest of the system.
///
/// The node owns no threads: every callback fires on whatever thread happens
/// to be executing a node operation, possibly several at once. Callbacks are
/// invoked with no port lock held; they may perform arbitrary work on other
/// threads but must not block on operations of the calling node from the
/// same thread.
pub trait NodeDelegate: Send + Sync {
    /// Mint a fresh port name, globally unique with overwhelming probability.
    ///
    /// A duplicate surfaces later as `PortExists`; treat that as a
    /// generator defect.
    fn generate_random_port_name(&self) -> PortName;

    /// Build a user message around embedder-controlled payload storage with
    /// `num_ports` unfilled transfer slots.
    fn alloc_message(&self, payload: Bytes, num_ports: usize) -> UserMessage {
        UserMessage::with_port_slots(payload, num_ports)
    }

    /// Ship an event to another node, one-way and asynchronous.
    ///
    /// The implementation must not synchronously re-enter the node that
    /// called it; events addressed to the calling node itself must loop back
    /// through `accept_event` asynchronously.
    fn forward_event(&self, to_node: NodeName, event: Event);

    /// A port may have become readable, or its peer closed. May be spurious;
    /// the embedder is expected to drain with `get_message` until empty.
    fn port_status_changed(&self, port: &PortRef);
}
