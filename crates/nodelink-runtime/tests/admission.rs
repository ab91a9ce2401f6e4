//! Per-IP admission control against a listener that never accepts.

mod common;

use common::*;
use nodelink_core::payload::{ConnectResponse, ListenResponse};
use nodelink_core::{ConnState, SocketId};
use nodelink_runtime::{requests, Node, ServerSnapshot};

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Poll until the admission counters for localhost match
fn wait_for_counts(node: &Node, nopening: usize, nwaiting: usize) -> ServerSnapshot {
    let deadline = Instant::now() + STEP;
    loop {
        if let Some(s) = node.server(Ipv4Addr::LOCALHOST) {
            assert!(s.nopening <= 3, "opening limit exceeded: {:?}", s);
            if s.nopening == nopening && s.nwaiting == nwaiting {
                return s;
            }
        }
        assert!(Instant::now() < deadline, "counts never reached {}/{}: {:?}", nopening, nwaiting, node.servers());
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_connects_capped_and_promoted_fifo() {
    let node = start_node();
    let (tx, rx) = mpsc::channel();

    spawn(&node, "crowd", move |ep| {
        // A listener that never accepts: the kernel backlog completes the
        // handshakes, and nothing is ever read from the connections
        requests::send_listen(ep, Ipv4Addr::LOCALHOST, 0, 100);
        let listen: ListenResponse = expect(ep);

        for id in 1..=7 {
            requests::send_connect(ep, "127.0.0.1", listen.port, id);
        }
        let mut arrivals: Vec<(u32, SocketId)> = Vec::new();
        while arrivals.len() < 7 {
            let c: ConnectResponse = wait_for(ep);
            assert!(c.error.is_none(), "{:?}", c.error);
            arrivals.push((c.request_id, c.sockid));
        }
        tx.send(arrivals).unwrap();
        // Keep the connections open until the test is done with them
        let _ = ep.receive(STEP * 3);
    });

    let arrivals = rx.recv_timeout(STEP).expect("every connect answered");
    // Before the i-th answer at most i connects have resolved, so only
    // requests 1..=3+i can have been promoted.
    for (i, (id, _)) in arrivals.iter().enumerate() {
        assert!(*id as usize <= i + 3, "request {} answered at position {}: {:?}", id, i, arrivals);
    }
    let mut ids: Vec<u32> = arrivals.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=7).collect::<Vec<u32>>());

    // Idle successes hold no slot
    let s = wait_for_counts(&node, 0, 0);
    assert_eq!(s.naccepted, 0);
    let connected = node
        .connections()
        .iter()
        .filter(|c| c.outbound && c.state == ConnState::Connected)
        .count();
    assert_eq!(connected, 7);

    stop(node);
}

#[test]
fn test_waiting_connect_promoted_by_success_alone() {
    let node = start_node();
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();

    // Three idle successes, then a fourth connect to the same IP that must be
    // attempted with no DELETE_CONNECTION in between
    spawn(&node, "lonely", move |ep| {
        requests::send_listen(ep, Ipv4Addr::LOCALHOST, 0, 100);
        let listen: ListenResponse = expect(ep);
        for id in 1..=3 {
            requests::send_connect(ep, "127.0.0.1", listen.port, id);
        }
        requests::send_connect(ep, "127.0.0.1", port, 4);
        let mut got = Vec::new();
        while got.len() < 4 {
            let c: ConnectResponse = wait_for(ep);
            got.push((c.request_id, c.error.is_none()));
        }
        tx.send(got).unwrap();
        let _ = ep.receive(STEP * 3);
    });

    let mut got = rx.recv_timeout(STEP).expect("fourth connect promoted");
    got.sort_unstable();
    assert_eq!(got, vec![(1, true), (2, true), (3, true), (4, false)]);
    wait_for_counts(&node, 0, 0);
    stop(node);
}

#[test]
fn test_failed_connects_free_slots() {
    let node = start_node();
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

    let (tx, rx) = mpsc::channel();
    spawn(&node, "doomed", move |ep| {
        for id in 1..=8 {
            requests::send_connect(ep, "127.0.0.1", port, id);
        }
        let mut order = Vec::new();
        while order.len() < 8 {
            let c: ConnectResponse = wait_for(ep);
            assert!(c.error.is_some());
            order.push(c.request_id);
        }
        tx.send(order).unwrap();
    });

    let mut order = rx.recv_timeout(STEP).expect("all failed");
    order.sort_unstable();
    assert_eq!(order, (1..=8).collect::<Vec<u32>>());
    wait_for_counts(&node, 0, 0);
    stop(node);
}
