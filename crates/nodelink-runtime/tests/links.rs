//! Link / exit propagation.

mod common;

use common::*;
use nodelink_core::payload::EndpointExit;
use nodelink_core::{tag, EndpointId, ExitReason};

use std::sync::mpsc;
use std::time::Duration;

const GO: u32 = tag::USER_BASE;
const PING: u32 = tag::USER_BASE + 1;
const ACK: u32 = tag::USER_BASE + 2;
const LINK_BACK: u32 = tag::USER_BASE + 3;

/// Endpoint that links to `target`, signals `ready`, then reports exits.
fn watcher(
    node: &nodelink_runtime::Node,
    target: EndpointId,
) -> (EndpointId, mpsc::Receiver<()>, mpsc::Receiver<EndpointExit>) {
    let (ready_tx, ready_rx) = mpsc::channel();
    let (exit_tx, exit_rx) = mpsc::channel();
    let id = spawn(node, "watcher", move |ep| {
        ep.link(target);
        ready_tx.send(()).unwrap();
        while let Some(msg) = ep.receive(Duration::from_secs(30)) {
            match msg.tag {
                tag::ENDPOINT_EXIT => {
                    if exit_tx.send(msg.decode::<EndpointExit>().unwrap()).is_err() {
                        break;
                    }
                }
                tag::KILL => break,
                _ => {}
            }
        }
    });
    (id, ready_rx, exit_rx)
}

/// Endpoint that exits (or panics) when told to
fn target(node: &nodelink_runtime::Node, panic: bool) -> EndpointId {
    spawn(node, "target", move |ep| {
        while let Some(msg) = ep.receive(Duration::from_secs(30)) {
            if msg.tag == tag::KILL {
                return;
            }
            if msg.tag == GO {
                if panic {
                    panic!("told to panic");
                }
                return;
            }
            if msg.tag == LINK_BACK {
                ep.link(msg.source);
            }
            if msg.tag == PING || msg.tag == LINK_BACK {
                ep.send(msg.source, ACK, Vec::new());
            }
        }
    })
}

#[test]
fn test_exit_delivered_exactly_once() {
    let node = start_node();
    let b = target(&node, false);
    let (a, ready, exits) = watcher(&node, b);
    ready.recv_timeout(STEP).unwrap();

    // b also links back to a and has messages queued when it exits
    node.send(a, b, LINK_BACK, Vec::new());
    {
        let (done_tx, done_rx) = mpsc::channel();
        spawn(&node, "helper", move |ep| {
            ep.link(b);
            done_tx.send(()).unwrap();
        });
        done_rx.recv_timeout(STEP).unwrap();
    }
    for _ in 0..5 {
        node.send(EndpointId::NULL, b, tag::USER_BASE + 60, vec![0; 16]);
    }
    node.send(EndpointId::NULL, b, GO, Vec::new());

    let exit = exits.recv_timeout(STEP).expect("exit");
    assert_eq!(exit.dead, b);
    assert_eq!(exit.reason, ExitReason::Normal);
    assert!(exits.recv_timeout(Duration::from_millis(300)).is_err(), "second exit delivered");

    // b is gone from the registry and from a's outlinks
    let endpoints = node.endpoints();
    assert!(endpoints.iter().all(|e| e.id != b));
    let a_info = endpoints.iter().find(|e| e.id == a).unwrap();
    assert!(!a_info.outlinks.contains(&b));

    stop(node);
}

#[test]
fn test_late_link_gets_no_such_endpoint() {
    let node = start_node();
    let ghost = node.addr().endpoint(9999);
    let (_, ready, exits) = watcher(&node, ghost);
    ready.recv_timeout(STEP).unwrap();

    let exit = exits.recv_timeout(STEP).expect("exit");
    assert_eq!(exit.dead, ghost);
    assert_eq!(exit.reason, ExitReason::NoSuchEndpoint);
    stop(node);
}

#[test]
fn test_panicking_endpoint() {
    let node = start_node();
    let b = target(&node, true);
    let (_, ready, exits) = watcher(&node, b);
    ready.recv_timeout(STEP).unwrap();

    node.send(EndpointId::NULL, b, GO, Vec::new());
    let exit = exits.recv_timeout(STEP).expect("exit");
    assert_eq!(exit.dead, b);
    assert_eq!(exit.reason, ExitReason::Panicked);
    stop(node);
}

#[test]
fn test_unlink_suppresses_exit() {
    let node = start_node();
    let b = target(&node, false);
    let (tx, rx) = mpsc::channel();
    spawn(&node, "fickle", move |ep| {
        ep.link(b);
        ep.unlink(b);
        ep.send(b, GO, Vec::new());
        let got = ep.receive(Duration::from_millis(300));
        tx.send(got.map(|m| m.tag)).unwrap();
    });
    assert_eq!(rx.recv_timeout(STEP).unwrap(), None);
    stop(node);
}

#[test]
fn test_remote_exit() {
    let n1 = start_node();
    let n2 = start_node();
    let b = target(&n2, false);
    let (_, ready, exits) = watcher(&n1, b);
    ready.recv_timeout(STEP).unwrap();

    // Remote traffic needs a local source
    n1.send(n1.manager_id(), b, GO, Vec::new());
    let exit = exits.recv_timeout(STEP).expect("exit");
    assert_eq!(exit.dead, b);
    assert_eq!(exit.reason, ExitReason::Normal);

    stop(n1);
    stop(n2);
}

#[test]
fn test_lost_peer_breaks_links() {
    let n1 = start_node();
    let n2 = start_node();
    let c = target(&n2, false);

    let (exit_tx, exit_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    spawn(&n1, "watcher", move |ep| {
        ep.link(c);
        // The ack comes back after the link arrived on the same stream
        ep.send(c, PING, Vec::new());
        let ack = next(ep);
        assert_eq!(ack.tag, ACK);
        ready_tx.send(()).unwrap();
        let exit: EndpointExit = wait_for(ep);
        exit_tx.send(exit).unwrap();
    });
    ready_rx.recv_timeout(STEP).unwrap();

    stop(n2);
    let exit = exit_rx.recv_timeout(STEP).expect("exit");
    assert_eq!(exit.dead, c);
    assert_eq!(exit.reason, ExitReason::ConnectionLost);
    stop(n1);
}
