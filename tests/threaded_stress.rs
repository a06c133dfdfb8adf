//! Parallel stress: receivers that keep moving between nodes while senders
//! blast messages at them. Exercises transfer races, proxy chains, and
//! closure chasing a port around the ring.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use portico_rs::test_harness::ThreadedNetwork;
use portico_rs::{Node, PortError, PortName, PortRef, UserMessage};

const NUM_NODES: usize = 4;
const NUM_PAIRS: usize = 2;
const MESSAGES_PER_PAIR: u64 = 300;
const DEADLINE: Duration = Duration::from_secs(60);

fn pair_of(payload: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(payload).ok()?;
    text.strip_prefix("data")?.parse().ok()
}

/// Read everything readable starting from one port, adopting and draining
/// any ports that arrive inside messages (a freshly adopted port gets no
/// retroactive wakeup, so it must be drained on the spot).
fn drain_from(
    node: &Node,
    start: PortName,
    owned: &mut HashSet<PortName>,
    records: &[Mutex<Vec<u64>>],
    pairs_done: &AtomicUsize,
) {
    let mut worklist = vec![start];
    while let Some(name) = worklist.pop() {
        let Ok(port_ref) = node.port(name) else {
            continue;
        };
        loop {
            match node.get_message(&port_ref) {
                Ok(Some(message)) => {
                    for carried in message.ports() {
                        owned.insert(*carried);
                        worklist.push(*carried);
                    }
                    if let Some(pair) = pair_of(message.payload()) {
                        records[pair]
                            .lock()
                            .expect("record lock poisoned")
                            .push(message.sequence_num());
                    }
                }
                Ok(None) => break,
                Err(PortError::PeerClosed) => {
                    node.close_port(&port_ref).expect("close drained port");
                    if owned.remove(&name) {
                        pairs_done.fetch_add(1, Ordering::SeqCst);
                    }
                    break;
                }
                // Transferred away mid-drain, or already gone.
                Err(_) => break,
            }
        }
    }
}

/// Randomly pass some owned receivers to the next node in the ring.
fn maybe_forward(
    node: &Node,
    pipe_out: &PortRef,
    owned: &mut HashSet<PortName>,
    rng: &mut StdRng,
) {
    let candidates: Vec<PortName> = owned.iter().copied().collect();
    for name in candidates {
        if !rng.gen_ratio(1, 3) {
            continue;
        }
        let mut carry = node.alloc_message("move", 1);
        carry.set_port(0, name);
        if node.send_message(pipe_out, carry).is_ok() {
            owned.remove(&name);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker(
    node: Arc<Node>,
    wakeups: Receiver<PortName>,
    pipe_out: PortRef,
    records: Arc<Vec<Mutex<Vec<u64>>>>,
    pairs_done: Arc<AtomicUsize>,
    no_forward: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut owned: HashSet<PortName> = HashSet::new();
    loop {
        match wakeups.recv_timeout(Duration::from_millis(10)) {
            Ok(name) => {
                drain_from(&node, name, &mut owned, &records, &pairs_done);
                if !no_forward.load(Ordering::SeqCst) {
                    maybe_forward(&node, &pipe_out, &mut owned, &mut rng);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if !no_forward.load(Ordering::SeqCst) {
                    maybe_forward(&node, &pipe_out, &mut owned, &mut rng);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn wait_until(deadline: Instant, what: &str, mut done: impl FnMut() -> bool) {
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn wait_idle(network: &ThreadedNetwork, deadline: Instant, what: &str) {
    let mut calm = 0;
    wait_until(deadline, what, || {
        if network.is_idle() {
            calm += 1;
        } else {
            calm = 0;
        }
        calm >= 5
    });
}

#[test]
fn moving_receivers_under_parallel_load() {
    let deadline = Instant::now() + DEADLINE;

    let mut network = ThreadedNetwork::new();
    let mut nodes = Vec::new();
    let mut wakeups = Vec::new();
    for _ in 0..NUM_NODES {
        let (node, wakeup_rx) = network.add_node();
        nodes.push(node);
        wakeups.push(Some(wakeup_rx));
    }

    // Ring of transfer pipes: node i can pass ports to node i+1.
    let mut pipe_out = Vec::new();
    let mut pipe_in = Vec::new();
    for i in 0..NUM_NODES {
        let j = (i + 1) % NUM_NODES;
        let pa = nodes[i].create_uninitialized_port().expect("pipe out");
        let pb = nodes[j].create_uninitialized_port().expect("pipe in");
        nodes[i]
            .initialize_port(&pa, nodes[j].name(), pb.name())
            .expect("init pipe out");
        nodes[j]
            .initialize_port(&pb, nodes[i].name(), pa.name())
            .expect("init pipe in");
        pipe_out.push(pa);
        pipe_in.push((j, pb));
    }

    let records: Arc<Vec<Mutex<Vec<u64>>>> =
        Arc::new((0..NUM_PAIRS).map(|_| Mutex::new(Vec::new())).collect());
    let pairs_done = Arc::new(AtomicUsize::new(0));
    let no_forward = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let mut worker_handles = Vec::new();
    for (i, wakeup_slot) in wakeups.iter_mut().enumerate() {
        let node = nodes[i].clone();
        let wakeup_rx = wakeup_slot.take().expect("wakeup receiver");
        let out = pipe_out[i].clone();
        let records = records.clone();
        let pairs_done = pairs_done.clone();
        let no_forward = no_forward.clone();
        let stop = stop.clone();
        worker_handles.push(thread::spawn(move || {
            worker(
                node,
                wakeup_rx,
                out,
                records,
                pairs_done,
                no_forward,
                stop,
                0xC0FFEE + i as u64,
            );
        }));
    }

    // Each pair: the sender stays on node 0; the receiver is immediately set
    // adrift around the ring.
    let mut senders = Vec::new();
    let mut sender_handles = Vec::new();
    for pair in 0..NUM_PAIRS {
        let (sender, receiver) = nodes[0].create_port_pair().expect("create pair");
        let mut carry = nodes[0].alloc_message("move", 1);
        carry.set_port(0, receiver.name());
        nodes[0]
            .send_message(&pipe_out[0], carry)
            .expect("seed transfer");

        let node = nodes[0].clone();
        let sender_clone = sender.clone();
        senders.push(sender);
        sender_handles.push(thread::spawn(move || {
            for n in 0..MESSAGES_PER_PAIR {
                node.send_message(&sender_clone, UserMessage::new(format!("data{pair}")))
                    .expect("send data");
                if n % 16 == 0 {
                    thread::yield_now();
                }
            }
        }));
    }
    for handle in sender_handles {
        handle.join().expect("sender thread");
    }

    // Phase 1: every message reaches its wandering receiver.
    wait_until(deadline, "all messages delivered", || {
        records
            .iter()
            .all(|r| r.lock().expect("record lock poisoned").len() as u64 == MESSAGES_PER_PAIR)
    });

    // Phase 2: freeze movement and let in-flight transfers finish, so the
    // closures about to be sent cannot race a port mid-handoff.
    no_forward.store(true, Ordering::SeqCst);
    wait_idle(&network, deadline, "transfers to settle");

    // Phase 3: close the senders; each closure chases its receiver to
    // wherever it ended up and the owning worker retires it.
    for sender in &senders {
        nodes[0].close_port(sender).expect("close sender");
    }
    wait_until(deadline, "receivers to observe closure", || {
        pairs_done.load(Ordering::SeqCst) == NUM_PAIRS
    });
    wait_idle(&network, deadline, "retirement traffic to settle");

    stop.store(true, Ordering::SeqCst);
    for handle in worker_handles {
        handle.join().expect("worker thread");
    }

    for (i, out) in pipe_out.iter().enumerate() {
        nodes[i].close_port(out).expect("close pipe out");
    }
    for (j, pipe) in &pipe_in {
        nodes[*j].close_port(pipe).expect("close pipe in");
    }
    wait_idle(&network, deadline, "closures to drain");
    network.shutdown();

    // Exactly once, in order, despite every transfer: each pair's record is
    // the full contiguous stamp sequence.
    for pair in 0..NUM_PAIRS {
        let stamps = records[pair].lock().expect("record lock poisoned");
        assert_eq!(stamps.len() as u64, MESSAGES_PER_PAIR, "pair {pair}");
        for (index, stamp) in stamps.iter().enumerate() {
            assert_eq!(*stamp, index as u64 + 1, "pair {pair} at {index}");
        }
    }

    // Nothing lingers: no proxies, no orphans.
    for node in &nodes {
        assert_eq!(node.port_count(), 0);
    }
}
