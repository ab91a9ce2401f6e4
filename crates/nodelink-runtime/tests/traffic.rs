//! Per-destination byte totals and the client port range.

mod common;

use common::*;
use nodelink_core::payload::{
    AcceptResponse, ConnectResponse, ConnectionClosed, ListenResponse, ReadResponse, WriteResponse,
};
use nodelink_core::{tag, SocketId};
use nodelink_runtime::{requests, Endpoint};

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Read from `sockid` until `want` bytes or EOF
fn read_exactly(ep: &Endpoint, sockid: SocketId, want: usize, first_request: u32) -> Vec<u8> {
    let mut got = Vec::new();
    let mut id = first_request;
    while got.len() < want {
        requests::send_read(ep, sockid, id);
        let read: ReadResponse = wait_for(ep);
        if read.is_eof() {
            break;
        }
        got.extend_from_slice(&read.data);
        id += 1;
    }
    got
}

#[test]
fn test_byte_totals_outlive_the_connection() {
    let x = start_node();
    let y = start_node();
    let (port_tx, port_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    spawn(&x, "server", move |ep| {
        requests::send_listen(ep, Ipv4Addr::LOCALHOST, 0, 1);
        let listen: ListenResponse = expect(ep);
        port_tx.send(listen.port).unwrap();
        requests::send_accept(ep, listen.sockid, 2);
        let accepted: AcceptResponse = expect(ep);

        let got = read_exactly(ep, accepted.sockid, 1000, 10);
        assert_eq!(got.len(), 1000);
        requests::send_write(ep, accepted.sockid, 3, vec![b'r'; 300]);
        let _: WriteResponse = wait_for(ep);
        // Drain to EOF once the client goes away
        read_exactly(ep, accepted.sockid, usize::MAX, 100);
        requests::send_delete_connection(ep, accepted.sockid);
        let _: ConnectionClosed = wait_for(ep);
    });

    let port = port_rx.recv_timeout(STEP).unwrap();
    spawn(&y, "client", move |ep| {
        requests::send_connect(ep, "127.0.0.1", port, 1);
        let c: ConnectResponse = expect(ep);
        assert!(c.error.is_none(), "{:?}", c.error);
        requests::send_write(ep, c.sockid, 2, vec![b'w'; 1000]);
        let _: WriteResponse = wait_for(ep);
        let back = read_exactly(ep, c.sockid, 300, 10);
        assert_eq!(back.len(), 300);
        requests::send_delete_connection(ep, c.sockid);
        let _: ConnectionClosed = wait_for(ep);
        done_tx.send(()).unwrap();
    });

    done_rx.recv_timeout(STEP).expect("client finished");
    let deadline = Instant::now() + STEP;
    while !y.connections().is_empty() {
        assert!(Instant::now() < deadline, "client connection still open");
        thread::sleep(Duration::from_millis(10));
    }

    let totals = y.traffic();
    let entry = totals
        .iter()
        .find(|t| t.ip == Ipv4Addr::LOCALHOST && t.port == port)
        .unwrap_or_else(|| panic!("no totals for port {}: {:?}", port, totals));
    assert_eq!((entry.read, entry.written), (300, 1000));

    // The accepting side keys its totals by the client's port
    let deadline = Instant::now() + STEP;
    loop {
        let server_side: Vec<_> = x.traffic().into_iter().filter(|t| t.port != port).collect();
        if server_side.iter().any(|t| t.read == 1000 && t.written == 300) {
            break;
        }
        assert!(Instant::now() < deadline, "server totals {:?}", server_side);
        thread::sleep(Duration::from_millis(10));
    }

    stop(x);
    stop(y);
}

#[test]
fn test_outbound_connects_use_client_ports() {
    let local = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let node = start_with(config().client_ports(local, local));
    let (tx, rx) = mpsc::channel();

    spawn(&node, "ranged", move |ep| {
        requests::send_listen(ep, Ipv4Addr::LOCALHOST, 0, 1);
        let listen: ListenResponse = expect(ep);
        requests::send_accept(ep, listen.sockid, 2);
        requests::send_connect(ep, "127.0.0.1", listen.port, 3);

        let mut connected = None;
        let mut accepted = None;
        while connected.is_none() || accepted.is_none() {
            let msg = next(ep);
            match msg.tag {
                tag::CONNECT_RESPONSE => connected = Some(msg.decode::<ConnectResponse>().unwrap()),
                tag::ACCEPT_RESPONSE => accepted = Some(msg.decode::<AcceptResponse>().unwrap()),
                other => panic!("unexpected tag {}", other),
            }
        }
        let (connected, accepted) = (connected.unwrap(), accepted.unwrap());
        assert!(connected.error.is_none(), "{:?}", connected.error);

        // The only port in the range is taken
        requests::send_connect(ep, "127.0.0.1", listen.port, 4);
        let second: ConnectResponse = wait_for(ep);
        tx.send((accepted.port, second.error.is_some(), connected.sockid)).unwrap();
        let _ = ep.receive(STEP * 3);
    });

    let (from_port, exhausted, sockid) = rx.recv_timeout(STEP).expect("connect results");
    assert_eq!(from_port, local);
    assert!(exhausted);
    let info = node.connections().into_iter().find(|c| c.sockid == sockid).expect("connection");
    assert_eq!(info.local_port, Some(local));
    stop(node);
}
