//! Echo server on the request API
//!
//! One acceptor endpoint keeps an ACCEPT outstanding on its listener; each
//! accepted socket gets its own endpoint that READs and WRITEs back until
//! EOF. No endpoint touches a socket directly.
//!
//! Usage:
//!     cargo run --release -p nodelink-echo -- [port]
//!     echo "hello" | nc -q1 localhost 9999
//!
//! # Environment Variables
//!
//! - `ECHO_PORT=<port>` - port to serve on when no argument is given (default: 9999)
//! - `ECHO_MAX_CONNS=<n>` - stop after this many connections, 0 = forever (default: 0)

use nodelink::prelude::*;
use nodelink::{env_get, logging};

use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, error, info, warn};

fn serve(ep: &Endpoint, sockid: SocketId) {
    let mut request = 1;
    requests::send_read(ep, sockid, request);
    while let Some(msg) = ep.receive(Wait::Forever) {
        match msg.tag {
            tag::READ_RESPONSE => {
                let Ok(read) = msg.decode::<ReadResponse>() else { break };
                if read.is_eof() {
                    requests::send_delete_connection(ep, sockid);
                    continue;
                }
                request += 1;
                requests::send_write(ep, sockid, request, read.data);
            }
            // Next read only once the echo is queued, so a slow client
            // throttles us
            tag::WRITE_RESPONSE => {
                request += 1;
                requests::send_read(ep, sockid, request);
            }
            tag::CONNECTION_CLOSED => {
                if let Ok(closed) = msg.decode::<ConnectionClosed>() {
                    if let Some(e) = closed.error {
                        debug!("{:?} closed: {}", sockid, e);
                    }
                }
                break;
            }
            tag::KILL => break,
            _ => {}
        }
    }
}

fn acceptor(ep: &Endpoint, port: u16, max_conns: usize) {
    requests::send_listen(ep, Ipv4Addr::UNSPECIFIED, port, 0);
    let listener = loop {
        let Some(msg) = ep.receive(Wait::Forever) else { continue };
        match msg.decode::<ListenResponse>() {
            Ok(ListenResponse { error: Some(e), .. }) => {
                error!("listen on port {} failed: {}", port, e);
                ep.node().shutdown();
                return;
            }
            Ok(resp) => break resp,
            Err(_) => continue,
        }
    };
    info!("echo server on port {}", listener.port);
    println!("echo server listening on port {}", listener.port);

    let node = ep.node();
    // CONNECTION_CLOSED comes to us as the socket owner; pass it on
    let mut servers: HashMap<SocketId, EndpointId> = HashMap::new();
    let mut served = 0usize;
    let mut request = 1;
    requests::send_accept(ep, listener.sockid, request);
    while let Some(msg) = ep.receive(Wait::Forever) {
        match msg.tag {
            tag::ACCEPT_RESPONSE => {
                let Ok(accepted) = msg.decode::<AcceptResponse>() else { continue };
                debug!("client {}:{}", accepted.hostname, accepted.port);
                let sockid = accepted.sockid;
                // Hand the socket to its own endpoint; we stay its owner, so
                // if we exit the reactor closes it
                match node.add_thread("echo", move |ep| serve(ep, sockid)) {
                    Ok(id) => {
                        servers.insert(sockid, id);
                    }
                    Err(e) => {
                        warn!("cannot serve client: {}", e);
                        requests::send_delete_connection(ep, sockid);
                    }
                }
                served += 1;
                if max_conns > 0 && served >= max_conns {
                    // No more ACCEPTs; leave once the last client is done.
                    // Deleting the listener now would close its clients too.
                    if servers.is_empty() {
                        break;
                    }
                    continue;
                }
                request += 1;
                requests::send_accept(ep, listener.sockid, request);
            }
            tag::CONNECTION_CLOSED => {
                let Ok(closed) = msg.decode::<ConnectionClosed>() else { continue };
                if let Some(id) = servers.remove(&closed.sockid) {
                    ep.send(id, msg.tag, msg.data);
                }
                if max_conns > 0 && served >= max_conns && servers.is_empty() {
                    break;
                }
            }
            tag::KILL => return,
            _ => {}
        }
    }
    node.shutdown();
}

fn main() {
    logging::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or_else(|| env_get("ECHO_PORT", 9999));
    let max_conns: usize = env_get("ECHO_MAX_CONNS", 0);

    let result = nodelink::run(NodeConfig::from_env(), |node| {
        node.add_thread("acceptor", move |ep| acceptor(ep, port, max_conns))?;
        Ok(())
    });
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
