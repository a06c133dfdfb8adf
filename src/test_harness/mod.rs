//! Simulated multi-node networks for exercising the routing core.
//!
//! Two drivers share the same delegate contract:
//!
//! - [`TestNetwork`]: single-threaded, deterministic. Events land in a
//!   priority queue with seeded-random priorities, so `pump` delivers them in
//!   a shuffled but reproducible order, so reordering tolerance gets
//!   exercised on every run.
//! - [`ThreadedNetwork`]: one router thread per node fed by a crossbeam
//!   channel, for stress tests that need real parallelism.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::core::{Event, NodeName, PortName, PortRef, UserMessage};
use crate::node::{Node, NodeDelegate};

/// Install a global subscriber so harness runs can be traced via `RUST_LOG`.
/// Safe to call from every test; only the first call wins.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One in-flight event, ordered by its random priority.
struct Task {
    priority: u32,
    order: u64,
    to_node: NodeName,
    event: Event,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.order.cmp(&self.order))
    }
}

struct TaskQueue {
    heap: BinaryHeap<Task>,
    rng: StdRng,
    next_order: u64,
}

struct NetworkInner {
    nodes: Mutex<HashMap<NodeName, Arc<Node>>>,
    tasks: Mutex<TaskQueue>,
    next_node_name: AtomicU64,
    next_port_name: AtomicU64,
}

impl NetworkInner {
    fn generate_port_name(&self) -> PortName {
        let value = self.next_port_name.fetch_add(1, AtomicOrdering::Relaxed);
        PortName::new(Uuid::from_u128(u128::from(value)))
    }

    fn node(&self, name: NodeName) -> Option<Arc<Node>> {
        self.nodes
            .lock()
            .expect("network node table poisoned")
            .get(&name)
            .cloned()
    }

    fn post(&self, to_node: NodeName, event: Event) {
        let mut tasks = self.tasks.lock().expect("network task queue poisoned");
        let priority = tasks.rng.gen();
        let order = tasks.next_order;
        tasks.next_order += 1;
        tasks.heap.push(Task {
            priority,
            order,
            to_node,
            event,
        });
    }
}

/// Deterministic single-threaded network of nodes.
pub struct TestNetwork {
    inner: Arc<NetworkInner>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::with_seed(0x0ddba11)
    }

    /// Seed controls the shuffled delivery order of `pump`.
    pub fn with_seed(seed: u64) -> Self {
        init_logging();
        Self {
            inner: Arc::new(NetworkInner {
                nodes: Mutex::new(HashMap::new()),
                tasks: Mutex::new(TaskQueue {
                    heap: BinaryHeap::new(),
                    rng: StdRng::seed_from_u64(seed),
                    next_order: 0,
                }),
                next_node_name: AtomicU64::new(1),
                next_port_name: AtomicU64::new(1),
            }),
        }
    }

    /// Create a node wired into this network.
    pub fn add_node(&self) -> TestNode {
        let value = self
            .inner
            .next_node_name
            .fetch_add(1, AtomicOrdering::Relaxed);
        let name = NodeName::new(Uuid::from_u128(u128::from(value) << 64));
        let delegate = Arc::new(TestNodeDelegate {
            node_name: name,
            network: self.inner.clone(),
            drop_events: AtomicBool::new(false),
            read_messages: AtomicBool::new(true),
            save_messages: AtomicBool::new(false),
            saved: Mutex::new(VecDeque::new()),
        });
        let node = Arc::new(Node::new(name, delegate.clone()));
        self.inner
            .nodes
            .lock()
            .expect("network node table poisoned")
            .insert(name, node.clone());
        TestNode {
            name,
            node,
            delegate,
        }
    }

    pub fn node(&self, name: NodeName) -> Option<Arc<Node>> {
        self.inner.node(name)
    }

    /// Deliver every queued event, including those generated along the way,
    /// in shuffled priority order.
    pub fn pump(&self) {
        loop {
            let task = {
                let mut tasks = self.inner.tasks.lock().expect("network task queue poisoned");
                match tasks.heap.pop() {
                    Some(task) => task,
                    None => return,
                }
            };
            let Some(node) = self.inner.node(task.to_node) else {
                tracing::debug!("dropping event for unknown node {}", task.to_node);
                continue;
            };
            if let Err(error) = node.accept_event(task.event) {
                tracing::warn!("accept_event failed at {}: {error}", task.to_node);
            }
        }
    }

    /// Throw away everything still queued.
    pub fn discard_pending(&self) {
        let mut tasks = self.inner.tasks.lock().expect("network task queue poisoned");
        tasks.heap.clear();
    }

    pub fn pending_events(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .expect("network task queue poisoned")
            .heap
            .len()
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A node plus its delegate handle inside a [`TestNetwork`].
pub struct TestNode {
    pub name: NodeName,
    pub node: Arc<Node>,
    pub delegate: Arc<TestNodeDelegate>,
}

impl TestNode {
    /// Pop the oldest message the delegate saved, if any.
    pub fn saved_message(&self) -> Option<UserMessage> {
        self.delegate.take_saved_message()
    }
}

/// Entangle one port on each of two nodes, the way a bootstrap handshake
/// would.
pub fn bootstrap_pipe(a: &TestNode, b: &TestNode) -> (PortRef, PortRef) {
    let pa = a
        .node
        .create_uninitialized_port()
        .expect("create bootstrap port");
    let pb = b
        .node
        .create_uninitialized_port()
        .expect("create bootstrap port");
    a.node
        .initialize_port(&pa, b.name, pb.name())
        .expect("initialize bootstrap port");
    b.node
        .initialize_port(&pb, a.name, pa.name())
        .expect("initialize bootstrap port");
    (pa, pb)
}

/// Delegate used by [`TestNetwork`] nodes.
///
/// By default a status wakeup drains the port and closes any received ports so
/// tests that only care about routing don't leak registry entries. Tests that
/// inspect payloads flip `set_save_messages(true)` and pull from the saved
/// queue instead; `set_drop_events(true)` simulates a dead link and
/// `set_read_messages(false)` a distracted embedder.
pub struct TestNodeDelegate {
    node_name: NodeName,
    network: Arc<NetworkInner>,
    drop_events: AtomicBool,
    read_messages: AtomicBool,
    save_messages: AtomicBool,
    saved: Mutex<VecDeque<UserMessage>>,
}

impl TestNodeDelegate {
    pub fn set_drop_events(&self, value: bool) {
        self.drop_events.store(value, AtomicOrdering::Relaxed);
    }

    pub fn set_read_messages(&self, value: bool) {
        self.read_messages.store(value, AtomicOrdering::Relaxed);
    }

    pub fn set_save_messages(&self, value: bool) {
        self.save_messages.store(value, AtomicOrdering::Relaxed);
    }

    pub fn take_saved_message(&self) -> Option<UserMessage> {
        self.saved
            .lock()
            .expect("saved message queue poisoned")
            .pop_front()
    }
}

impl NodeDelegate for TestNodeDelegate {
    fn generate_random_port_name(&self) -> PortName {
        self.network.generate_port_name()
    }

    fn forward_event(&self, to_node: NodeName, event: Event) {
        if self.drop_events.load(AtomicOrdering::Relaxed) {
            tracing::debug!(
                "dropping event from {} to {}",
                self.node_name,
                to_node
            );
            return;
        }
        self.network.post(to_node, event);
    }

    fn port_status_changed(&self, port: &PortRef) {
        if !self.read_messages.load(AtomicOrdering::Relaxed) {
            return;
        }
        let Some(node) = self.network.node(self.node_name) else {
            return;
        };
        loop {
            match node.get_message(port) {
                Ok(Some(message)) => {
                    if self.save_messages.load(AtomicOrdering::Relaxed) {
                        self.saved
                            .lock()
                            .expect("saved message queue poisoned")
                            .push_back(message);
                    } else {
                        for name in message.ports() {
                            if let Ok(received) = node.port(*name) {
                                let _ = node.close_port(&received);
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }
}

struct ThreadedEntry {
    node: Arc<Node>,
    events: Sender<Event>,
}

struct ThreadedInner {
    nodes: Mutex<HashMap<NodeName, ThreadedEntry>>,
}

impl ThreadedInner {
    fn post(&self, to_node: NodeName, event: Event) {
        let nodes = self.nodes.lock().expect("threaded node table poisoned");
        if let Some(entry) = nodes.get(&to_node) {
            let _ = entry.events.send(event);
        }
    }
}

/// Parallel network: each node's events are applied by a dedicated router
/// thread, and status wakeups fan out to per-node channels for worker threads
/// to consume.
pub struct ThreadedNetwork {
    inner: Arc<ThreadedInner>,
    routers: Vec<JoinHandle<()>>,
}

impl ThreadedNetwork {
    pub fn new() -> Self {
        init_logging();
        Self {
            inner: Arc::new(ThreadedInner {
                nodes: Mutex::new(HashMap::new()),
            }),
            routers: Vec::new(),
        }
    }

    /// Create a node with its router thread. Returns the node and the channel
    /// on which readable port names arrive.
    pub fn add_node(&mut self) -> (Arc<Node>, Receiver<PortName>) {
        let name = NodeName::new(Uuid::new_v4());
        let (event_tx, event_rx) = unbounded::<Event>();
        let (wakeup_tx, wakeup_rx) = unbounded::<PortName>();
        let delegate = Arc::new(ThreadedNodeDelegate {
            network: self.inner.clone(),
            wakeups: wakeup_tx,
        });
        let node = Arc::new(Node::new(name, delegate));
        self.inner
            .nodes
            .lock()
            .expect("threaded node table poisoned")
            .insert(
                name,
                ThreadedEntry {
                    node: node.clone(),
                    events: event_tx,
                },
            );

        let router_node = node.clone();
        let handle = std::thread::spawn(move || {
            for event in event_rx {
                if let Err(error) = router_node.accept_event(event) {
                    tracing::warn!("accept_event failed at {}: {error}", router_node.name());
                }
            }
        });
        self.routers.push(handle);
        (node, wakeup_rx)
    }

    /// True when no node has events waiting. Events being applied right now
    /// may still generate more; poll until this stays true.
    pub fn is_idle(&self) -> bool {
        let nodes = self.inner.nodes.lock().expect("threaded node table poisoned");
        nodes.values().all(|entry| entry.events.is_empty())
    }

    /// Close the event channels and join the router threads.
    pub fn shutdown(mut self) -> Vec<Arc<Node>> {
        let nodes: Vec<Arc<Node>> = {
            let mut table = self.inner.nodes.lock().expect("threaded node table poisoned");
            table.drain().map(|(_, entry)| entry.node).collect()
        };
        for handle in self.routers.drain(..) {
            let _ = handle.join();
        }
        nodes
    }
}

impl Default for ThreadedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

struct ThreadedNodeDelegate {
    network: Arc<ThreadedInner>,
    wakeups: Sender<PortName>,
}

impl NodeDelegate for ThreadedNodeDelegate {
    fn generate_random_port_name(&self) -> PortName {
        PortName::new(Uuid::new_v4())
    }

    fn forward_event(&self, to_node: NodeName, event: Event) {
        self.network.post(to_node, event);
    }

    fn port_status_changed(&self, port: &PortRef) {
        let _ = self.wakeups.send(port.name());
    }
}
