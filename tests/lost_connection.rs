//! Losing a node converts its peers' ports to peer-closed.

use portico_rs::test_harness::{bootstrap_pipe, TestNetwork};
use portico_rs::{PortError, UserMessage};

#[test]
fn lost_connection_cleans_up_transferred_ports() {
    let network = TestNetwork::new();
    let n0 = network.add_node();
    let n1 = network.add_node();
    n0.delegate.set_read_messages(false);
    n1.delegate.set_read_messages(false);

    let (x0, _x1) = bootstrap_pipe(&n0, &n1);

    // Ship one end of a fresh pair to n1, then lose n1. Dropping n1's events
    // is how the dead link is simulated.
    n1.delegate.set_drop_events(true);

    let (a0, a1) = n0.node.create_port_pair().expect("create pair");
    let mut carry = n0.node.alloc_message("foo", 1);
    carry.set_port(0, a1.name());
    n0.node.send_message(&x0, carry).expect("send carry");
    network.pump();

    n0.node.lost_connection_to_node(n1.name).expect("lost");
    network.pump();

    // a1's local record (stuck buffering: PortAccepted was dropped) is gone,
    // and a0 is still closable.
    n0.node.close_port(&a0).expect("close a0");
    n0.node.close_port(&x0).expect("close x0");
    network.pump();
    assert_eq!(n0.node.port_count(), 0);
}

#[test]
fn lost_connection_marks_receiving_ports_peer_closed() {
    let network = TestNetwork::new();
    let n0 = network.add_node();
    let n1 = network.add_node();
    n0.delegate.set_read_messages(false);
    n1.delegate.set_read_messages(false);

    let (x0, x1) = bootstrap_pipe(&n0, &n1);

    let (a0, a1) = n0.node.create_port_pair().expect("create pair");
    let mut carry = n0.node.alloc_message("take a1", 1);
    carry.set_port(0, a1.name());
    n0.node.send_message(&x0, carry).expect("send carry");
    network.pump();

    n1.delegate.set_drop_events(true);
    n0.node.lost_connection_to_node(n1.name).expect("lost");
    network.pump();

    // a0's peer now lives on the lost node: reads report closure.
    assert_eq!(n0.node.get_message(&a0), Err(PortError::PeerClosed));
    let status = n0.node.get_status(&a0).expect("status");
    assert!(status.peer_closed);

    // x1 still exists at n1 but nothing more will arrive from n0 either way.
    drop(x1);

    n0.node.close_port(&a0).expect("close a0");
    n0.node.close_port(&x0).expect("close x0");
}

#[test]
fn loss_boundary_is_what_the_reader_already_consumed() {
    let network = TestNetwork::new();
    let n0 = network.add_node();
    let n1 = network.add_node();
    n0.delegate.set_read_messages(false);
    n1.delegate.set_read_messages(false);

    let (x0, x1) = bootstrap_pipe(&n0, &n1);

    n1.node
        .send_message(&x1, UserMessage::new("read"))
        .expect("send");
    n1.node
        .send_message(&x1, UserMessage::new("unread"))
        .expect("send");
    network.pump();

    let message = n0
        .node
        .get_message(&x0)
        .expect("get")
        .expect("first message");
    assert_eq!(message.payload(), b"read");

    n0.node.lost_connection_to_node(n1.name).expect("lost");

    // Everything past the last consumed stamp is declared lost, including
    // the message already sitting in the queue unread.
    assert_eq!(n0.node.get_message(&x0), Err(PortError::PeerClosed));

    n0.node.close_port(&x0).expect("close x0");
    n1.node.close_port(&x1).expect("close x1");
}

#[test]
fn lost_connection_is_idempotent() {
    let network = TestNetwork::new();
    let n0 = network.add_node();
    let n1 = network.add_node();
    n0.delegate.set_read_messages(false);
    n1.delegate.set_read_messages(false);

    let (x0, _x1) = bootstrap_pipe(&n0, &n1);

    n0.node.lost_connection_to_node(n1.name).expect("first");
    n0.node.lost_connection_to_node(n1.name).expect("second");

    assert_eq!(n0.node.get_message(&x0), Err(PortError::PeerClosed));
    n0.node.close_port(&x0).expect("close x0");
}
