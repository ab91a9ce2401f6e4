//! Ping/pong across two nodes
//!
//! Starts two nodes in one process on loopback. `pong` lives on the second
//! node and echoes every message; `ping` on the first sends a batch of
//! messages addressed to it and times the round trips. The first message
//! opens the peer link, so it also pays for the handshake.
//!
//! # Environment Variables
//!
//! - `PINGPONG_ROUNDS=<n>` - round trips to make (default: 10000)
//! - `PINGPONG_SIZE=<bytes>` - payload size (default: 64)
//! - `NODELINK_LOG_LEVEL=<level>` - log level (default: info)

use nodelink::prelude::*;
use nodelink::{env_get, logging};

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const PING: u32 = tag::USER_BASE;
const PONG: u32 = tag::USER_BASE + 1;

fn pong(ep: &Endpoint) {
    while let Some(msg) = ep.receive(Wait::Forever) {
        match msg.tag {
            PING => ep.send(msg.source, PONG, msg.data),
            tag::KILL => break,
            _ => {}
        }
    }
}

/// Returns the time of the first round trip and of the rest
fn ping(ep: &Endpoint, target: EndpointId, rounds: usize, size: usize) -> Option<(Duration, Duration)> {
    ep.link(target);
    let payload = vec![0x5a; size];

    let mut first = Duration::ZERO;
    let start = Instant::now();
    for round in 0..rounds {
        let sent = Instant::now();
        ep.send(target, PING, payload.clone());
        loop {
            let msg = ep.receive(Duration::from_secs(10))?;
            match msg.tag {
                PONG => break,
                tag::ENDPOINT_EXIT => {
                    let exit = msg.decode::<EndpointExit>().ok()?;
                    error!("pong {} exited: {:?}", exit.dead, exit.reason);
                    return None;
                }
                _ => {}
            }
        }
        if round == 0 {
            first = sent.elapsed();
        }
    }
    Some((first, start.elapsed() - first))
}

fn main() {
    logging::init();

    let rounds: usize = env_get("PINGPONG_ROUNDS", 10_000).max(1);
    let size: usize = env_get("PINGPONG_SIZE", 64);

    println!("=== nodelink ping/pong ===\n");
    println!("Configuration:");
    println!("  Rounds: {}, payload: {} bytes", rounds, size);
    println!();

    let config = || NodeConfig::new().listen_ip(Ipv4Addr::LOCALHOST);
    let (a, b) = match (Node::start(config()), Node::start(config())) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => {
            error!("cannot start nodes: {}", e);
            std::process::exit(1);
        }
    };
    info!("ping node {}, pong node {}", a.addr(), b.addr());

    let (tx, rx) = mpsc::channel();
    let spawned = b.add_thread("pong", pong).and_then(|target| {
        a.add_thread("ping", move |ep| {
            let _ = tx.send(ping(ep, target, rounds, size));
        })
    });
    let result = match spawned {
        Ok(_) => rx.recv().ok().flatten(),
        Err(e) => {
            error!("cannot spawn endpoints: {}", e);
            None
        }
    };

    for node in [a, b] {
        node.shutdown();
        if let Err(e) = node.join() {
            error!("join: {}", e);
        }
    }

    match result {
        Some((first, rest)) => {
            println!("First round trip (with handshake): {:?}", first);
            if rounds > 1 {
                let n = (rounds - 1) as u32;
                println!("Remaining {} round trips: {:?} ({:?} each)", n, rest, rest / n);
            }
        }
        None => {
            println!("ping/pong failed");
            std::process::exit(1);
        }
    }
}
