//! The routing node: port registry, public API, and event handlers.

pub mod delegate;

pub use delegate::NodeDelegate;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::core::port::PortInner;
use crate::core::{
    Event, EventData, NodeName, ObserveProxy, Port, PortDescriptor, PortError, PortName, PortRef,
    PortState, PortStatus, Result, UserData, UserMessage, INITIAL_SEQUENCE_NUM,
    INVALID_SEQUENCE_NUM,
};

/// Queue of events addressed to this node by its own ports, drained by
/// whichever sender finds the flag clear. Keeps local delivery iterative:
/// re-entrant sends enqueue instead of growing the stack.
struct LocalDelivery {
    delivering: bool,
    queue: VecDeque<Event>,
}

/// A routing instance.
///
/// Owns the mapping from port name to port record and implements the full
/// event protocol between nodes. All methods are safe to call from any
/// thread; the node itself owns no threads and calls back into the embedder
/// through its [`NodeDelegate`] with no internal lock held.
pub struct Node {
    name: NodeName,
    delegate: Arc<dyn NodeDelegate>,
    /// Registry of live ports. Leaf lock: held only across
    /// insert/erase/lookup/snapshot, never while acquiring a port lock.
    ports: Mutex<HashMap<PortName, Arc<Port>>>,
    /// Serializes the batch carried-port lock phase of sends so concurrent
    /// transfers of overlapping port sets cannot interleave acquisition.
    send_with_ports: Mutex<()>,
    local: Mutex<LocalDelivery>,
}

impl Node {
    /// The delegate must outlive every operation on this node; callbacks may
    /// arrive on any thread.
    pub fn new(name: NodeName, delegate: Arc<dyn NodeDelegate>) -> Self {
        Self {
            name,
            delegate,
            ports: Mutex::new(HashMap::new()),
            send_with_ports: Mutex::new(()),
            local: Mutex::new(LocalDelivery {
                delivering: false,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> NodeName {
        self.name
    }

    /// Look up a registered port by name.
    pub fn port(&self, port_name: PortName) -> Result<PortRef> {
        self.get_port(port_name)
            .map(|port| PortRef::new(port_name, port))
            .ok_or(PortError::PortUnknown)
    }

    /// Number of ports currently registered. Diagnostic: a drained, quiescent
    /// node that was shut down cleanly holds zero.
    pub fn port_count(&self) -> usize {
        self.ports.lock().expect("port registry lock poisoned").len()
    }

    /// Allocate a port that is not yet entangled with a peer. Messages sent
    /// on it buffer locally until `initialize_port`. Useful for
    /// bootstrapping a pipe between two nodes; same-node pairs come from
    /// `create_port_pair` instead.
    pub fn create_uninitialized_port(&self) -> Result<PortRef> {
        let port_name = self.delegate.generate_random_port_name();
        let port = Arc::new(Port::new(INITIAL_SEQUENCE_NUM, INITIAL_SEQUENCE_NUM));
        self.add_port_with_name(port_name, port.clone())?;
        Ok(PortRef::new(port_name, port))
    }

    /// Entangle a freshly created port with its peer and flush anything sent
    /// while it was uninitialized.
    pub fn initialize_port(
        &self,
        port_ref: &PortRef,
        peer_node: NodeName,
        peer_port: PortName,
    ) -> Result<()> {
        let mut outbound = Vec::new();
        {
            let mut inner = port_ref.port().lock();
            if inner.state != PortState::Uninitialized {
                return Err(PortError::PortStateUnexpected);
            }
            inner.state = PortState::Receiving;
            inner.peer_node = peer_node;
            inner.peer_port = peer_port;
            self.flush_outgoing_messages_locked(&mut inner, &mut outbound);
        }
        self.send_outbound(outbound);
        self.delegate.port_status_changed(port_ref);
        Ok(())
    }

    /// Create an entangled pair of ports on this node, initialized and ready.
    pub fn create_port_pair(&self) -> Result<(PortRef, PortRef)> {
        let port0 = self.create_uninitialized_port()?;
        let port1 = self.create_uninitialized_port()?;
        self.initialize_port(&port0, self.name, port1.name())?;
        self.initialize_port(&port1, self.name, port0.name())?;
        Ok((port0, port1))
    }

    pub fn set_user_data(&self, port_ref: &PortRef, user_data: UserData) -> Result<()> {
        let mut inner = port_ref.port().lock();
        if inner.state == PortState::Closed {
            return Err(PortError::PortStateUnexpected);
        }
        inner.user_data = Some(user_data);
        Ok(())
    }

    pub fn user_data(&self, port_ref: &PortRef) -> Result<Option<UserData>> {
        let inner = port_ref.port().lock();
        if inner.state == PortState::Closed {
            return Err(PortError::PortStateUnexpected);
        }
        Ok(inner.user_data.clone())
    }

    /// Close a receiving port. The peer learns the final stamp so it can
    /// drain everything already in flight before reporting `PeerClosed`.
    pub fn close_port(&self, port_ref: &PortRef) -> Result<()> {
        let (peer_node, event) = {
            let mut inner = port_ref.port().lock();
            if inner.state != PortState::Receiving {
                return Err(PortError::PortStateUnexpected);
            }
            inner.state = PortState::Closed;
            let last_sequence_num = inner.next_sequence_num_to_send - 1;
            (
                inner.peer_node,
                Event::new(
                    inner.peer_port,
                    EventData::ObserveClosure { last_sequence_num },
                ),
            )
        };
        self.delegate.forward_event(peer_node, event);
        self.erase_port(port_ref.name());
        Ok(())
    }

    pub fn get_status(&self, port_ref: &PortRef) -> Result<PortStatus> {
        let inner = port_ref.port().lock();
        if inner.state != PortState::Receiving {
            return Err(PortError::PortStateUnexpected);
        }
        Ok(PortStatus {
            has_messages: inner.message_queue.has_next_message(),
            peer_closed: inner.peer_closed,
        })
    }

    /// Pull the next in-order message, if any.
    ///
    /// Returns `Err(PeerClosed)` only once the peer has closed *and* every
    /// message it ever sent has been consumed; until then buffered messages
    /// keep coming.
    pub fn get_message(&self, port_ref: &PortRef) -> Result<Option<UserMessage>> {
        self.get_message_impl(port_ref, None)
    }

    /// Like `get_message`, but the head message is released only if the
    /// selector accepts it. The selector must not call back into the node.
    pub fn get_message_if<F>(&self, port_ref: &PortRef, selector: F) -> Result<Option<UserMessage>>
    where
        F: Fn(&UserMessage) -> bool,
    {
        self.get_message_impl(port_ref, Some(&selector))
    }

    fn get_message_impl(
        &self,
        port_ref: &PortRef,
        selector: Option<&dyn Fn(&UserMessage) -> bool>,
    ) -> Result<Option<UserMessage>> {
        let message = {
            let mut inner = port_ref.port().lock();
            // A port that has been sent away is gone from the embedder's
            // point of view, same as an unknown name.
            if inner.state != PortState::Receiving {
                return Err(PortError::PortStateUnexpected);
            }
            if !inner.can_accept_more_messages() {
                return Err(PortError::PeerClosed);
            }
            inner.message_queue.next_message_if(selector)
        };

        // Reading the message that carried a port is what makes that port
        // visible; only now may its queue start waking the embedder.
        if let Some(message) = &message {
            for name in message.ports() {
                match self.get_port(*name) {
                    Some(port) => {
                        let mut inner = port.lock();
                        debug_assert_eq!(inner.state, PortState::Receiving);
                        inner.message_queue.set_signalable(true);
                    }
                    None => {
                        tracing::error!("carried port {} missing at {}", name, self.name);
                    }
                }
            }
        }
        Ok(message)
    }

    /// Build a user message via the delegate's storage hook.
    pub fn alloc_message(&self, payload: impl Into<Bytes>, num_ports: usize) -> UserMessage {
        self.delegate.alloc_message(payload.into(), num_ports)
    }

    /// Send a message (and any ports it carries) toward the peer.
    ///
    /// Carried ports must be local and receiving; they are re-homed to the
    /// destination as part of the send. Sending on an uninitialized port
    /// buffers until `initialize_port`.
    pub fn send_message(&self, port_ref: &PortRef, message: UserMessage) -> Result<()> {
        for name in message.ports() {
            if *name == port_ref.name() {
                return Err(PortError::CannotSendSelf);
            }
        }

        let mut message = message;
        let (peer_node, event) = {
            let mut inner = port_ref.port().lock();
            if inner.state != PortState::Receiving && inner.state != PortState::Uninitialized {
                return Err(PortError::PortStateUnexpected);
            }
            if inner.state == PortState::Receiving && inner.peer_closed {
                return Err(PortError::PeerClosed);
            }

            let mut ports_taken = Vec::new();
            self.will_send_message_locked(
                &mut inner,
                port_ref.name(),
                &mut message,
                Some(&mut ports_taken),
            )?;

            if inner.state == PortState::Uninitialized {
                inner.outgoing_messages.push_back(message);
                inner.outgoing_ports.extend(ports_taken);
                return Ok(());
            }

            debug_assert_eq!(inner.state, PortState::Receiving);
            (
                inner.peer_node,
                Event::new(inner.peer_port, EventData::User(message)),
            )
        };

        if peer_node != self.name {
            self.delegate.forward_event(peer_node, event);
            return Ok(());
        }
        self.deliver_local_event(event)
    }

    /// Entry point for every event arriving from the delegate.
    pub fn accept_event(&self, event: Event) -> Result<()> {
        match event.data {
            EventData::User(message) => self.on_user_message(event.to_port, message),
            EventData::PortAccepted => self.on_port_accepted(event.to_port),
            EventData::ObserveProxy(observe) => self.on_observe_proxy(event.to_port, observe),
            EventData::ObserveProxyAck { last_sequence_num } => {
                self.on_observe_proxy_ack(event.to_port, last_sequence_num)
            }
            EventData::ObserveClosure { last_sequence_num } => {
                self.on_observe_closure(event.to_port, last_sequence_num)
            }
        }
    }

    /// Communication with `node_name` is gone for good: every port whose peer
    /// lives there is marked peer-closed with the boundary set to the last
    /// message actually received, and ports that were merely relaying for
    /// that node are dropped. Idempotent.
    pub fn lost_connection_to_node(&self, node_name: NodeName) -> Result<()> {
        tracing::debug!(
            "observing lost connection from {} to {}",
            self.name,
            node_name
        );

        let snapshot: Vec<(PortName, Arc<Port>)> = {
            let ports = self.ports.lock().expect("port registry lock poisoned");
            ports
                .iter()
                .map(|(name, port)| (*name, port.clone()))
                .collect()
        };

        let mut to_notify = Vec::new();
        for (name, port) in snapshot {
            let mut remove_port = false;
            {
                let mut inner = port.lock();
                if inner.peer_node == node_name {
                    // No more messages will arrive from this peer, and no
                    // PortAccepted either.
                    if !inner.peer_closed {
                        inner.peer_closed = true;
                        inner.last_sequence_num_to_receive =
                            inner.message_queue.next_sequence_num() - 1;
                        if inner.state == PortState::Receiving {
                            to_notify.push(PortRef::new(name, port.clone()));
                        }
                    }
                    if inner.state != PortState::Receiving {
                        remove_port = true;
                    }
                }
            }
            if remove_port {
                self.erase_port(name);
            }
        }

        for port_ref in &to_notify {
            self.delegate.port_status_changed(port_ref);
        }
        Ok(())
    }

    fn on_user_message(&self, to_port: PortName, message: UserMessage) -> Result<()> {
        tracing::trace!(
            "accepting message {} with {} ports at {} @ {}",
            message.sequence_num(),
            message.num_ports(),
            to_port,
            self.name
        );

        // Bind carried ports to this node first, whatever the fate of the
        // message itself. If the message is later forwarded they transfer
        // again the usual way; if it cannot be accepted they are closed.
        let carried: Vec<PortName> = message.ports().to_vec();
        for (index, name) in carried.iter().enumerate() {
            self.accept_port(*name, message.descriptor(index))?;
        }

        let port = self.get_port(to_port);
        let mut accepted = false;
        let mut notify = false;
        let mut outbound = Vec::new();
        let mut result = Ok(());

        if let Some(port) = &port {
            let mut inner = port.lock();
            // Reject spurious arrivals past the advertised final stamp.
            if inner.can_accept_more_messages() {
                accepted = true;
                let mut has_next_message = inner.message_queue.accept_message(message);

                match inner.state {
                    PortState::Buffering => has_next_message = false,
                    PortState::Proxying => {
                        has_next_message = false;
                        // Drain in sequence order so the queue's cursor keeps
                        // counting what this proxy has relayed; retirement
                        // depends on that count reaching the boundary.
                        match self.forward_messages_locked(&mut inner, to_port, &mut outbound) {
                            Ok(()) => {
                                self.maybe_remove_proxy_locked(&mut inner, to_port, &mut outbound);
                            }
                            Err(error) => result = Err(error),
                        }
                    }
                    _ => {}
                }

                if inner.state == PortState::Receiving && has_next_message {
                    notify = true;
                }
            }
        }

        self.send_outbound(outbound);
        result?;

        if !accepted {
            tracing::debug!("message for {} @ {} not accepted", to_port, self.name);
            // The freshly bound ports are orphans; close them so their peers
            // find out.
            for name in &carried {
                match self.port(*name) {
                    Ok(orphan) => {
                        let _ = self.close_port(&orphan);
                    }
                    Err(_) => {
                        tracing::warn!("orphaned port {} already gone at {}", name, self.name);
                    }
                }
            }
        } else if notify {
            if let Some(port) = port {
                self.delegate
                    .port_status_changed(&PortRef::new(to_port, port));
            }
        }
        Ok(())
    }

    fn on_port_accepted(&self, port_name: PortName) -> Result<()> {
        let Some(port) = self.get_port(port_name) else {
            tracing::error!("PortAccepted for unknown port {} @ {}", port_name, self.name);
            return Err(PortError::PortUnknown);
        };

        let mut outbound = Vec::new();
        let result = {
            let mut inner = port.lock();
            self.port_accepted_locked(&mut inner, port_name, &mut outbound)
        };
        self.send_outbound(outbound);
        result
    }

    fn port_accepted_locked(
        &self,
        inner: &mut PortInner,
        port_name: PortName,
        outbound: &mut Vec<(NodeName, Event)>,
    ) -> Result<()> {
        tracing::debug!(
            "port accepted at {} @ {} pointing to {} @ {}",
            port_name,
            self.name,
            inner.peer_port,
            inner.peer_node
        );
        if inner.state != PortState::Buffering {
            tracing::error!(
                "PortAccepted for non-buffering port {} @ {}",
                port_name,
                self.name
            );
            return Err(PortError::PortStateUnexpected);
        }
        inner.state = PortState::Proxying;
        self.forward_messages_locked(inner, port_name, outbound)?;

        // Closure may have been observed while buffering; then the final
        // stamp is already known and no ObserveProxy round is needed, but
        // the closure still has to travel past this hop to the new home.
        if inner.remove_proxy_on_last_message {
            if inner.peer_closed {
                outbound.push((
                    inner.peer_node,
                    Event::new(
                        inner.peer_port,
                        EventData::ObserveClosure {
                            last_sequence_num: inner.last_sequence_num_to_receive,
                        },
                    ),
                ));
            }
            self.maybe_remove_proxy_locked(inner, port_name, outbound);
        } else {
            self.initiate_proxy_removal_locked(inner, port_name, outbound);
        }
        Ok(())
    }

    fn on_observe_proxy(&self, port_name: PortName, observe: ObserveProxy) -> Result<()> {
        // The port may have been closed locally already; the closure event it
        // emitted carries the final stamp, so this event can be dropped.
        let Some(port) = self.get_port(port_name) else {
            tracing::debug!("ObserveProxy for unknown port {} @ {}", port_name, self.name);
            return Ok(());
        };

        tracing::debug!(
            "ObserveProxy at {} @ {}: proxy {} @ {} points to {} @ {}",
            port_name,
            self.name,
            observe.proxy_port,
            observe.proxy_node,
            observe.proxy_to_port,
            observe.proxy_to_node
        );

        let mut outbound = Vec::new();
        {
            let mut inner = port.lock();
            if inner.peer_node == observe.proxy_node && inner.peer_port == observe.proxy_port {
                if inner.state == PortState::Receiving {
                    inner.peer_node = observe.proxy_to_node;
                    inner.peer_port = observe.proxy_to_port;
                    outbound.push((
                        observe.proxy_node,
                        Event::new(
                            observe.proxy_port,
                            EventData::ObserveProxyAck {
                                last_sequence_num: inner.next_sequence_num_to_send - 1,
                            },
                        ),
                    ));
                } else {
                    // We are a proxy ourselves, so we cannot vouch for a
                    // final stamp: some other port may be sending to our peer
                    // now that our own ObserveProxy is out. Defer a null ack
                    // until after our removal so the asker re-sends then,
                    // rather than ping-ponging with us now.
                    tracing::debug!(
                        "delaying ObserveProxyAck to {} @ {}",
                        observe.proxy_port,
                        observe.proxy_node
                    );
                    inner.send_on_proxy_removal = Some((
                        observe.proxy_node,
                        Event::new(
                            observe.proxy_port,
                            EventData::ObserveProxyAck {
                                last_sequence_num: INVALID_SEQUENCE_NUM,
                            },
                        ),
                    ));
                }
            } else {
                // Not our proxy: pass it along toward the port that refers to
                // it.
                outbound.push((
                    inner.peer_node,
                    Event::new(inner.peer_port, EventData::ObserveProxy(observe)),
                ));
            }
        }
        self.send_outbound(outbound);
        Ok(())
    }

    fn on_observe_proxy_ack(&self, port_name: PortName, last_sequence_num: u64) -> Result<()> {
        tracing::debug!(
            "ObserveProxyAck at {} @ {} (last_sequence_num={})",
            port_name,
            self.name,
            last_sequence_num
        );

        // The port may have observed closure first; not an error.
        let Some(port) = self.get_port(port_name) else {
            return Err(PortError::PortUnknown);
        };

        let mut outbound = Vec::new();
        let result = {
            let mut inner = port.lock();
            self.observe_proxy_ack_locked(&mut inner, port_name, last_sequence_num, &mut outbound)
        };
        self.send_outbound(outbound);
        result
    }

    fn observe_proxy_ack_locked(
        &self,
        inner: &mut PortInner,
        port_name: PortName,
        last_sequence_num: u64,
        outbound: &mut Vec<(NodeName, Event)>,
    ) -> Result<()> {
        if inner.state != PortState::Proxying {
            tracing::error!(
                "ObserveProxyAck for non-proxying port {} @ {}",
                port_name,
                self.name
            );
            return Err(PortError::PortStateUnexpected);
        }

        if last_sequence_num == INVALID_SEQUENCE_NUM {
            // The peer was itself mid-removal; ask again.
            self.initiate_proxy_removal_locked(inner, port_name, outbound);
            return Ok(());
        }

        inner.remove_proxy_on_last_message = true;
        inner.last_sequence_num_to_receive = last_sequence_num;
        self.maybe_remove_proxy_locked(inner, port_name, outbound);
        Ok(())
    }

    fn on_observe_closure(&self, port_name: PortName, last_sequence_num: u64) -> Result<()> {
        // Fine if the port is already gone; it closed first.
        let Some(port) = self.get_port(port_name) else {
            return Ok(());
        };

        // The closure is forwarded along past proxies until it reaches the
        // receiving end, doubling as an ObserveProxyAck for each hop: no
        // stamp beyond last_sequence_num will ever arrive.
        let mut notify = false;
        let mut outbound = Vec::new();
        {
            let mut inner = port.lock();
            inner.peer_closed = true;
            inner.last_sequence_num_to_receive = last_sequence_num;

            tracing::debug!(
                "ObserveClosure at {} @ {} (state={:?}) pointing to {} @ {} (last_sequence_num={})",
                port_name,
                self.name,
                inner.state,
                inner.peer_port,
                inner.peer_node,
                last_sequence_num
            );

            if inner.state == PortState::Receiving {
                notify = true;
            } else {
                let next_node = inner.peer_node;
                let next_port = inner.peer_port;
                inner.remove_proxy_on_last_message = true;

                // A proxy's peer cannot participate in removal any more, so
                // retire on our own and propagate the closure past us.
                if inner.state == PortState::Proxying {
                    self.maybe_remove_proxy_locked(&mut inner, port_name, &mut outbound);
                    outbound.push((
                        next_node,
                        Event::new(next_port, EventData::ObserveClosure { last_sequence_num }),
                    ));
                }
            }
        }
        self.send_outbound(outbound);
        if notify {
            self.delegate
                .port_status_changed(&PortRef::new(port_name, port));
        }
        Ok(())
    }

    fn add_port_with_name(&self, port_name: PortName, port: Arc<Port>) -> Result<()> {
        let mut ports = self.ports.lock().expect("port registry lock poisoned");
        if ports.contains_key(&port_name) {
            tracing::error!("duplicate port name {} @ {}", port_name, self.name);
            return Err(PortError::PortExists);
        }
        ports.insert(port_name, port);
        tracing::debug!("created port {} @ {}", port_name, self.name);
        Ok(())
    }

    fn erase_port(&self, port_name: PortName) {
        let mut ports = self.ports.lock().expect("port registry lock poisoned");
        ports.remove(&port_name);
        tracing::debug!("deleted port {} @ {}", port_name, self.name);
    }

    fn get_port(&self, port_name: PortName) -> Option<Arc<Port>> {
        let ports = self.ports.lock().expect("port registry lock poisoned");
        ports.get(&port_name).cloned()
    }

    /// Re-home one carried port: mint its destination name, snapshot its
    /// counters into the descriptor, and point it at its new address. The
    /// port buffers until the destination confirms with `PortAccepted`.
    fn will_send_port_locked(
        &self,
        port: &mut PortInner,
        to_node: NodeName,
        local_name: PortName,
    ) -> (PortName, PortDescriptor) {
        let new_name = self.delegate.generate_random_port_name();

        debug_assert_eq!(port.state, PortState::Receiving);
        port.state = PortState::Buffering;

        let descriptor = PortDescriptor {
            peer_node: port.peer_node,
            peer_port: port.peer_port,
            referring_node: self.name,
            referring_port: local_name,
            next_sequence_num_to_send: port.next_sequence_num_to_send,
            next_sequence_num_to_receive: port.message_queue.next_sequence_num(),
        };

        port.peer_node = to_node;
        port.peer_port = new_name;
        (new_name, descriptor)
    }

    /// Construct the local record for a port received inside a message and
    /// tell the old home to start proxying.
    fn accept_port(&self, port_name: PortName, descriptor: &PortDescriptor) -> Result<()> {
        let port = Arc::new(Port::new(
            descriptor.next_sequence_num_to_send,
            descriptor.next_sequence_num_to_receive,
        ));
        {
            let mut inner = port.lock();
            inner.state = PortState::Receiving;
            inner.peer_node = descriptor.peer_node;
            inner.peer_port = descriptor.peer_port;
            // Not signalable until the message that carried this port is
            // actually read by the embedder.
            inner.message_queue.set_signalable(false);
        }
        self.add_port_with_name(port_name, port)?;

        self.delegate.forward_event(
            descriptor.referring_node,
            Event::new(descriptor.referring_port, EventData::PortAccepted),
        );
        Ok(())
    }

    /// Stamp an outgoing message and re-home any ports it carries. The
    /// sender's lock is held by the caller; carried ports are locked here, in
    /// sorted-name order under the send-with-ports mutex.
    fn will_send_message_locked(
        &self,
        sender: &mut PortInner,
        sender_name: PortName,
        message: &mut UserMessage,
        ports_taken: Option<&mut Vec<Arc<Port>>>,
    ) -> Result<()> {
        // Forwarded messages already carry their stamp; fresh ones get the
        // next one from the sending port.
        let stamped_here = message.sequence_num() == 0;
        if stamped_here {
            message.set_sequence_num(sender.next_sequence_num_to_send);
            sender.next_sequence_num_to_send += 1;
        }

        let num_ports = message.num_ports();
        if num_ports > 0 {
            // Another thread could be trying to send the same ports; the
            // batch mutex keeps multi-port acquisition single-file.
            let _batch = self
                .send_with_ports
                .lock()
                .expect("send-with-ports lock poisoned");

            let mut carried: Vec<Arc<Port>> = Vec::with_capacity(num_ports);
            let mut failure = None;
            for name in message.ports() {
                match self.get_port(*name) {
                    Some(port) => carried.push(port),
                    None => {
                        failure = Some(PortError::PortUnknown);
                        break;
                    }
                }
            }

            let mut order: Vec<usize> = (0..num_ports).collect();
            order.sort_by_key(|&index| message.ports()[index]);
            if failure.is_none()
                && order
                    .windows(2)
                    .any(|pair| message.ports()[pair[0]] == message.ports()[pair[1]])
            {
                // The same port cannot be transferred twice in one message;
                // locking it twice would wedge this thread.
                failure = Some(PortError::PortStateUnexpected);
            }

            let mut guards: Vec<Option<MutexGuard<'_, PortInner>>> = Vec::new();
            guards.resize_with(num_ports, || None);
            if failure.is_none() {
                for &index in &order {
                    let guard = carried[index].lock();
                    if guard.state != PortState::Receiving {
                        failure = Some(PortError::PortStateUnexpected);
                        break;
                    }
                    if message.ports()[index] == sender.peer_port {
                        failure = Some(PortError::CannotSendPeer);
                        break;
                    }
                    guards[index] = Some(guard);
                }
            }

            if let Some(error) = failure {
                drop(guards);
                // Backpedal on the stamp; untouched ports stay as they were.
                if stamped_here {
                    sender.next_sequence_num_to_send -= 1;
                }
                return Err(error);
            }

            for index in 0..num_ports {
                let guard = guards[index].as_mut().expect("carried port locked");
                let local_name = message.ports()[index];
                let (new_name, descriptor) =
                    self.will_send_port_locked(guard, sender.peer_node, local_name);
                message.set_slot(index, new_name, descriptor);
            }
            drop(guards);

            if let Some(ports_taken) = ports_taken {
                ports_taken.extend(carried.iter().cloned());
            }
        }

        tracing::trace!(
            "sending message {} from {} @ {} to {} @ {}",
            message.sequence_num(),
            sender_name,
            self.name,
            sender.peer_port,
            sender.peer_node
        );
        Ok(())
    }

    /// Drain the queue in sequence order through the will-send path,
    /// collecting forwardable events for emission after the lock drops.
    fn forward_messages_locked(
        &self,
        inner: &mut PortInner,
        port_name: PortName,
        outbound: &mut Vec<(NodeName, Event)>,
    ) -> Result<()> {
        while let Some(mut message) = inner.message_queue.next_message_if(None) {
            self.will_send_message_locked(inner, port_name, &mut message, None)?;
            outbound.push((
                inner.peer_node,
                Event::new(inner.peer_port, EventData::User(message)),
            ));
        }
        Ok(())
    }

    /// Announce this port as a proxy so the sender can route around it. The
    /// reply is an ObserveProxyAck, or an ObserveClosure if the peer closed
    /// in the meantime.
    fn initiate_proxy_removal_locked(
        &self,
        inner: &PortInner,
        port_name: PortName,
        outbound: &mut Vec<(NodeName, Event)>,
    ) {
        outbound.push((
            inner.peer_node,
            Event::new(
                inner.peer_port,
                EventData::ObserveProxy(ObserveProxy {
                    proxy_node: self.name,
                    proxy_port: port_name,
                    proxy_to_node: inner.peer_node,
                    proxy_to_port: inner.peer_port,
                }),
            ),
        ));
    }

    /// Retire a proxy once retirement is authorized and the queue has drained
    /// to the boundary; otherwise wait for the next arrival or closure.
    fn maybe_remove_proxy_locked(
        &self,
        inner: &mut PortInner,
        port_name: PortName,
        outbound: &mut Vec<(NodeName, Event)>,
    ) {
        debug_assert_eq!(inner.state, PortState::Proxying);

        if !inner.remove_proxy_on_last_message {
            return;
        }
        if inner.can_accept_more_messages() {
            tracing::trace!(
                "proxy {} @ {} waiting for more messages",
                port_name,
                self.name
            );
            return;
        }

        self.erase_port(port_name);
        if let Some(deferred) = inner.send_on_proxy_removal.take() {
            outbound.push(deferred);
        }
    }

    /// Release everything buffered while the port was uninitialized, now that
    /// its real peer is known.
    fn flush_outgoing_messages_locked(
        &self,
        inner: &mut PortInner,
        outbound: &mut Vec<(NodeName, Event)>,
    ) {
        debug_assert!(inner.peer_node.is_valid());

        // Ports carried by the buffered messages were rewired before the
        // destination node was known; fix their peer node now.
        let outgoing_ports = std::mem::take(&mut inner.outgoing_ports);
        for carried in outgoing_ports {
            carried.lock().peer_node = inner.peer_node;
        }

        while let Some(message) = inner.outgoing_messages.pop_front() {
            outbound.push((
                inner.peer_node,
                Event::new(inner.peer_port, EventData::User(message)),
            ));
        }
    }

    /// Queue an event addressed to this very node and drain if nobody else
    /// is. Events surfacing during the drain (re-entrant sends from delegate
    /// notifications) enqueue behind it instead of recursing.
    fn deliver_local_event(&self, event: Event) -> Result<()> {
        let deliver = {
            let mut local = self.local.lock().expect("local delivery lock poisoned");
            local.queue.push_back(event);
            if local.delivering {
                false
            } else {
                local.delivering = true;
                true
            }
        };
        if !deliver {
            return Ok(());
        }

        loop {
            let next = {
                let mut local = self.local.lock().expect("local delivery lock poisoned");
                match local.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        local.delivering = false;
                        return Ok(());
                    }
                }
            };
            if let Err(error) = self.accept_event(next) {
                let mut local = self.local.lock().expect("local delivery lock poisoned");
                local.delivering = false;
                return Err(error);
            }
        }
    }

    fn send_outbound(&self, outbound: Vec<(NodeName, Event)>) {
        for (to_node, event) in outbound {
            self.delegate.forward_event(to_node, event);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Ok(ports) = self.ports.lock() {
            if !ports.is_empty() {
                tracing::warn!(
                    "unclean shutdown for node {}: {} ports left",
                    self.name,
                    ports.len()
                );
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("name", &self.name).finish()
    }
}
